//! Handlebars rendering of the project document.
//!
//! Templates see two variables:
//!
//! - `env` - the process environment (`{{env.HOME}}`),
//! - `project_dir` - the directory holding the project document.
//!
//! Rendering is strict: referencing an unset variable is an error rather
//! than an empty string.

use std::collections::BTreeMap;
use std::path::Path;

use handlebars::Handlebars;
use serde_json::json;

/// Render `template` with the environment and `project_dir` in scope.
///
/// # Errors
///
/// Returns the renderer's message if the template is malformed or refers
/// to an undefined variable.
pub fn render(template: &str, project_dir: &Path) -> Result<String, String> {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    render_with(template, project_dir, &env)
}

/// [`render`] with an explicit environment.
///
/// # Errors
///
/// See [`render`].
pub fn render_with(
    template: &str,
    project_dir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<String, String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    // The output is YAML, not HTML.
    handlebars.register_escape_fn(handlebars::no_escape);

    let context = json!({
        "env": env,
        "project_dir": project_dir.display().to_string(),
    });
    handlebars
        .render_template(template, &context)
        .map_err(|e| e.to_string())
}
