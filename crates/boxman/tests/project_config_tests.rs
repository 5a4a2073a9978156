//! Project document -> resource graph, through the public API.
//!
//! Run with:
//! ```sh
//! cargo test -p boxman --test project_config_tests
//! ```

#![allow(clippy::needless_raw_string_hashes)]

use std::fs;
use std::path::PathBuf;

use boxman::config::{load_project, ConfigError};
use boxman::graph::Machines;
use boxman::names::{resolve, ResolvedName};
use boxman::ResourceGraph;
use tempfile::TempDir;

const PROJECT: &str = r#"
project: lab
clusters:
  web:
    base_image: ubuntu-base
    workdir: "{{project_dir}}/.boxman/web"
    admin_user: ops
    networks:
      front:
        mode: nat
        ip:
          address: 10.60.0.1
          dhcp: { range: { start: 10.60.0.10, end: 10.60.0.99 } }
    vms:
      app1:
        memory: 2048
        disks:
          - { name: data, target: vdb, size: 4096 }
        network_adapters:
          - { network_source: front }
          - { network_source: db::back }
          - { network_source: default, is_global: true }
      app2:
        hostname: app-two
        network_adapters:
          - { name: mgmt, network_source: front }
    files:
      inventory/hosts: |
        app1
        app2
  db:
    base_image: ubuntu-base
    workdir: "{{project_dir}}/.boxman/db"
    networks:
      back:
        ip: { address: 10.61.0.1 }
    vms:
      pg:
        template: postgres-base
        network_adapters:
          - { network_source: back }
tasks:
  ping:
    description: Ping every VM
    command: ansible all -m ping
"#;

fn write_project(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("conf.yml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_project_file_renders_and_builds() {
    let dir = TempDir::new().unwrap();
    let path = write_project(&dir, PROJECT);

    let config = load_project(&path).unwrap();
    let graph = ResourceGraph::build(&config).unwrap();

    assert_eq!(graph.project, "lab");
    let clusters: Vec<&str> = graph.clusters.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(clusters, ["web", "db"]);

    let web = &graph.clusters[0];
    let project_dir = fs::canonicalize(dir.path()).unwrap();
    assert_eq!(web.workdir, project_dir.join(".boxman/web"));
    assert_eq!(web.admin_user, "ops");
    assert_eq!(web.key_path, web.workdir.join("id_ed25519_boxman"));
    assert_eq!(web.ssh_config_path, web.workdir.join("ssh_config"));
    assert_eq!(web.networks[0].control_name(), "lab_web_front");
    assert_eq!(web.files[0].path, web.workdir.join("inventory/hosts"));

    let app1 = &web.vms[0];
    assert_eq!(app1.control_name, "lab_web_app1");
    assert_eq!(app1.hostname, "app1");
    assert_eq!(app1.source, "ubuntu-base");
    assert_eq!(app1.os_disk, web.workdir.join("lab_web_app1.qcow2"));
    assert_eq!(
        app1.disks[0].attachment.path,
        web.workdir.join("lab_web_app1_data.qcow2")
    );

    let networks: Vec<&str> = app1
        .adapters
        .iter()
        .map(|a| a.attachment.network.as_str())
        .collect();
    assert_eq!(networks, ["lab_web_front", "lab_db_back", "default"]);
    let adapter_names: Vec<&str> = app1.adapters.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(adapter_names, ["eth0", "eth1", "eth2"]);

    // Global networks are not ours to create.
    let required: Vec<String> = web.required_networks().into_iter().collect();
    assert_eq!(required, ["lab_db_back", "lab_web_front"]);

    assert_eq!(web.vms[1].hostname, "app-two");
    assert_eq!(web.vms[1].adapters[0].name, "mgmt");
    assert_eq!(graph.clusters[1].vms[0].source, "postgres-base");
}

#[test]
fn test_machine_selection_across_clusters() {
    let dir = TempDir::new().unwrap();
    let config = load_project(&write_project(&dir, PROJECT)).unwrap();
    let graph = ResourceGraph::build(&config).unwrap();

    assert_eq!(graph.select(&Machines::All).unwrap().len(), 3);

    let machines: Machines = "db::pg, lab_web_app2".parse().unwrap();
    let selected: Vec<&str> = graph
        .select(&machines)
        .unwrap()
        .into_iter()
        .map(|(_, vm)| vm.control_name.as_str())
        .collect();
    assert_eq!(selected, ["lab_web_app2", "lab_db_pg"]);

    let unknown: Machines = "app3".parse().unwrap();
    assert!(matches!(
        graph.select(&unknown),
        Err(ConfigError::UnknownMachine { .. })
    ));
}

#[test]
fn test_adapter_to_undeclared_network_is_rejected() {
    let dir = TempDir::new().unwrap();
    let body = PROJECT.replace("db::back", "db::missing");
    let config = load_project(&write_project(&dir, &body)).unwrap();

    assert!(matches!(
        ResourceGraph::build(&config),
        Err(ConfigError::UnknownNetwork { ref network, .. }) if network == "lab::db::missing"
    ));
}

#[test]
fn test_undefined_template_variable_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let body = PROJECT.replace("{{project_dir}}/.boxman/db", "{{nope}}/db");

    assert!(matches!(
        load_project(&write_project(&dir, &body)),
        Err(ConfigError::Render { .. })
    ));
}

#[test]
fn test_explicit_three_part_reference() {
    let resolved = resolve("other::c9::net", "lab", "web", false).unwrap();
    assert_eq!(resolved.project(), Some("other"));
    assert_eq!(resolved.control_name(), "other_c9_net");

    let global = resolve("br0", "lab", "web", true).unwrap();
    assert_eq!(global, ResolvedName::Global("br0".into()));
}
