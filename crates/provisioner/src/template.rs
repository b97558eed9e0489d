use handlebars::Handlebars;
use serde::Serialize;

use crate::Result;

/// Cloud-init document used when the configuration doesn't provide one.
pub const DEFAULT_CLOUD_INIT: &str = r#"
# Update packages
package_update: true
# Install packages
packages:
  - curl
  - git
# Run additional commands
runcmd:
  - [df, -h]
  - [git, version]
  - [curl, --version ]
  - C:\Users\david\startup.bat {{project_id}} {{link}}
"#;

/// Values available to the bootstrap template.
///
/// Unset values are left out of the render context, so a template that
/// references one fails instead of rendering an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

pub fn render(template: &str, values: &BootstrapValues) -> Result<String> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);

    Ok(registry.render_template(template, values)?)
}
