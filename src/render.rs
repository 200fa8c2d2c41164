//! Connection-string templating.
//!
//! A service's `format` is rendered against its published endpoint:
//!
//! ```
//! use temaki::render::{render, EndpointVars};
//!
//! let vars = EndpointVars { host: "127.0.0.1".to_string(), port: 32768 };
//! let url = render("redis://{{Host}}:{{Port}}/0", &vars).unwrap();
//! assert_eq!(url, "redis://127.0.0.1:32768/0");
//! ```
//!
//! `{{.Host}}` is accepted as well and `Port0` is an alias of `Port`.
//! Whitespace inside the braces is ignored.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Lazily compiled placeholder pattern.
static PLACEHOLDER_PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown field `{field}` in template `{template}`")]
    UnknownField { field: String, template: String },

    #[error("unterminated `{{{{` in template `{0}`")]
    Unterminated(String),

    #[error("invalid placeholder pattern: {0}")]
    Pattern(String),
}

/// Values available to a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointVars {
    pub host: String,
    pub port: u16,
}

/// One `NAME=VALUE` assignment handed to the test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEnvVar {
    pub name: String,
    pub value: String,
}

impl fmt::Display for RenderedEnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn get_placeholder_pattern() -> Result<&'static Regex, RenderError> {
    let result = PLACEHOLDER_PATTERN.get_or_init(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}"));

    match result {
        Ok(regex) => Ok(regex),
        Err(e) => Err(RenderError::Pattern(e.to_string())),
    }
}

/// Substitutes every placeholder in `template`.
pub fn render(template: &str, vars: &EndpointVars) -> Result<String, RenderError> {
    let pattern = get_placeholder_pattern()?;

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for caps in pattern.captures_iter(template) {
        let (Some(whole), Some(field)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        rendered.push_str(&template[last..whole.start()]);

        let name = field.as_str().strip_prefix('.').unwrap_or(field.as_str());
        match name {
            "Host" => rendered.push_str(&vars.host),
            "Port" | "Port0" => rendered.push_str(&vars.port.to_string()),
            _ => {
                return Err(RenderError::UnknownField {
                    field: field.as_str().to_string(),
                    template: template.to_string(),
                });
            }
        }

        last = whole.end();
    }

    let tail = &template[last..];
    if tail.contains("{{") {
        return Err(RenderError::Unterminated(template.to_string()));
    }
    rendered.push_str(tail);

    Ok(rendered)
}

/// Renders a service's template into its environment assignment.
pub fn render_env_var(
    name: &str,
    template: &str,
    vars: &EndpointVars,
) -> Result<RenderedEnvVar, RenderError> {
    Ok(RenderedEnvVar {
        name: name.to_string(),
        value: render(template, vars)?,
    })
}
