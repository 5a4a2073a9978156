//! Libvirt XML documents: rendering definitions and reading back the few
//! attributes the control plane needs to compare.

use regex::Regex;
use uuid::Uuid;

use super::{
    ControlError, CpuTopology, DiskAttachment, DomainLayout, InterfaceInfo, NetworkDefinition,
    NetworkInfo,
};

/// Escape text for use inside an XML attribute or element.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// `<network>` document for `net-define`.
#[must_use]
pub fn network_xml(definition: &NetworkDefinition) -> String {
    network_xml_with_uuid(definition, Uuid::new_v4())
}

fn network_xml_with_uuid(definition: &NetworkDefinition, uuid: Uuid) -> String {
    let bridge = &definition.bridge;
    let mut xml = String::from("<network>\n");
    xml.push_str(&format!("  <name>{}</name>\n", escape(&definition.name)));
    xml.push_str(&format!("  <uuid>{uuid}</uuid>\n"));
    xml.push_str(&format!("  <forward mode='{}'/>\n", definition.mode));
    xml.push_str("  <bridge");
    if let Some(name) = &bridge.name {
        xml.push_str(&format!(" name='{}'", escape(name)));
    }
    xml.push_str(&format!(
        " stp='{}' delay='{}'/>\n",
        if bridge.stp { "on" } else { "off" },
        bridge.delay
    ));
    if let Some(mac) = &definition.mac {
        xml.push_str(&format!("  <mac address='{}'/>\n", escape(mac)));
    }
    xml.push_str(&format!(
        "  <ip address='{}' netmask='{}'",
        escape(&definition.address),
        escape(&definition.netmask)
    ));
    match &definition.dhcp {
        Some((start, end)) => {
            xml.push_str(">\n    <dhcp>\n");
            xml.push_str(&format!(
                "      <range start='{}' end='{}'/>\n",
                escape(start),
                escape(end)
            ));
            xml.push_str("    </dhcp>\n  </ip>\n");
        }
        None => xml.push_str("/>\n"),
    }
    xml.push_str("</network>\n");
    xml
}

/// `<disk>` document for `attach-device`.
#[must_use]
pub fn disk_xml(disk: &DiskAttachment) -> String {
    format!(
        "<disk type='file' device='disk'>\n  \
         <driver name='{}' type='{}'/>\n  \
         <source file='{}'/>\n  \
         <target dev='{}' bus='virtio'/>\n\
         </disk>\n",
        escape(&disk.driver),
        escape(&disk.format),
        escape(&disk.path.display().to_string()),
        escape(&disk.target),
    )
}

/// Rewrite vCPU count, CPU topology and memory in a `<domain>` document.
///
/// # Errors
///
/// Returns [`ControlError::Invalid`] if the document has no `<vcpu>` or
/// `<memory>` element to rewrite.
pub fn apply_resources(
    xml: &str,
    cpus: Option<CpuTopology>,
    memory_mib: Option<u64>,
) -> Result<String, ControlError> {
    let mut xml = xml.to_string();

    if let Some(memory_mib) = memory_mib {
        let kib = memory_mib * 1024;
        for element in ["memory", "currentMemory"] {
            let re = pattern(&format!(r"<{element}\b[^>]*>\s*\d+\s*</{element}>"))?;
            if !re.is_match(&xml) && element == "memory" {
                return Err(ControlError::Invalid("domain has no <memory> element".into()));
            }
            let replacement = format!("<{element} unit='KiB'>{kib}</{element}>");
            xml = re
                .replace(&xml, regex::NoExpand(&replacement))
                .into_owned();
        }
    }

    if let Some(cpus) = cpus {
        let vcpu = pattern(r"<vcpu\b([^>]*)>\s*\d+\s*</vcpu>")?;
        if !vcpu.is_match(&xml) {
            return Err(ControlError::Invalid("domain has no <vcpu> element".into()));
        }
        xml = vcpu
            .replace(&xml, format!("<vcpu${{1}}>{}</vcpu>", cpus.vcpus()).as_str())
            .into_owned();

        let topology = format!(
            "<topology sockets='{}' cores='{}' threads='{}'/>",
            cpus.sockets, cpus.cores, cpus.threads
        );
        let existing = pattern(r"<topology\b[^>]*/>")?;
        let self_closing_cpu = pattern(r"<cpu\b([^>]*?)/>")?;
        let open_cpu = pattern(r"<cpu\b[^>]*>")?;

        xml = if existing.is_match(&xml) {
            existing
                .replace(&xml, regex::NoExpand(&topology))
                .into_owned()
        } else if self_closing_cpu.is_match(&xml) {
            self_closing_cpu
                .replace(&xml, format!("<cpu${{1}}>{topology}</cpu>").as_str())
                .into_owned()
        } else if let Some(m) = open_cpu.find(&xml) {
            let mut out = xml.clone();
            out.insert_str(m.end(), &topology);
            out
        } else {
            xml.replacen("</domain>", &format!("  <cpu>{topology}</cpu>\n</domain>"), 1)
        };
    }

    Ok(xml)
}

fn pattern(source: &str) -> Result<Regex, ControlError> {
    Regex::new(source).map_err(|e| ControlError::Invalid(format!("invalid pattern: {e}")))
}

/// Value of `attribute` on the first `<element>` in `xml`.
///
/// # Errors
///
/// Returns [`ControlError::Invalid`] if the names produce an invalid pattern.
pub fn attribute(xml: &str, element: &str, attribute: &str) -> Result<Option<String>, ControlError> {
    let re = pattern(&format!(
        r#"<{}\b[^>]*\s{}=(?:'([^']*)'|"([^"]*)")"#,
        regex::escape(element),
        regex::escape(attribute)
    ))?;
    Ok(re.captures(xml).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| unescape(m.as_str()))
    }))
}

/// Text content of the first `<element>` in `xml`.
///
/// # Errors
///
/// Returns [`ControlError::Invalid`] if the name produces an invalid pattern.
pub fn text(xml: &str, element: &str) -> Result<Option<String>, ControlError> {
    let name = regex::escape(element);
    let re = pattern(&format!(r"(?s)<{name}>(.*?)</{name}>"))?;
    Ok(re
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str().trim())))
}

/// Fill the definition fields of `info` from a `net-dumpxml` document.
///
/// # Errors
///
/// Propagates pattern construction failures.
pub fn read_network(xml: &str, info: &mut NetworkInfo) -> Result<(), ControlError> {
    info.mode = attribute(xml, "forward", "mode")?;
    info.bridge = attribute(xml, "bridge", "name")?;
    info.address = attribute(xml, "ip", "address")?;
    info.netmask = attribute(xml, "ip", "netmask")?;
    Ok(())
}

fn to_mib(amount: u64, unit: &str) -> Option<u64> {
    match unit {
        "k" | "KiB" => Some(amount / 1024),
        "M" | "MiB" => Some(amount),
        "G" | "GiB" => Some(amount * 1024),
        _ => None,
    }
}

/// Read vCPUs, memory, disk targets and interfaces from a `dumpxml`
/// document.
///
/// # Errors
///
/// Propagates pattern construction failures.
pub fn read_layout(xml: &str) -> Result<DomainLayout, ControlError> {
    let vcpus = pattern(r"<vcpu\b[^>]*>\s*(\d+)\s*</vcpu>")?
        .captures(xml)
        .and_then(|caps| caps[1].parse().ok());

    let unit = attribute(xml, "memory", "unit")?.unwrap_or_else(|| "KiB".to_string());
    let memory_mib = pattern(r"<memory\b[^>]*>\s*(\d+)\s*</memory>")?
        .captures(xml)
        .and_then(|caps| caps[1].parse().ok())
        .and_then(|amount| to_mib(amount, &unit));

    let mut disk_targets = Vec::new();
    for caps in pattern(r"(?s)<disk\b([^>]*)>(.*?)</disk>")?.captures_iter(xml) {
        let opening = format!("<disk{}>", &caps[1]);
        if attribute(&opening, "disk", "device")?.as_deref() != Some("disk") {
            continue;
        }
        if let Some(target) = attribute(&caps[2], "target", "dev")? {
            disk_targets.push(target);
        }
    }

    let mut interfaces = Vec::new();
    for caps in pattern(r"(?s)<interface\b[^>]*>(.*?)</interface>")?.captures_iter(xml) {
        interfaces.push(InterfaceInfo {
            network: attribute(&caps[1], "source", "network")?,
            mac: attribute(&caps[1], "mac", "address")?,
        });
    }

    Ok(DomainLayout {
        vcpus,
        memory_mib,
        disk_targets,
        interfaces,
    })
}
