//! Boot document rendering.
//!
//! The user-data served to a booting runner is a tera template rendered with
//! two variables: `name` and `jitconfig`. Templates are compiled when they are
//! loaded, so a syntax error stops the controller at startup instead of
//! failing every boot.

use std::path::{Path, PathBuf};

use tera::{Context, Tera};
use thiserror::Error;

const BUILTIN_USER_DATA: &str = include_str!("../templates/user-data.yaml");
const TEMPLATE_NAME: &str = "user-data";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid user-data template: {0}")]
    Syntax(#[source] tera::Error),

    #[error("failed to render user-data: {0}")]
    Render(#[source] tera::Error),
}

/// A compiled user-data template.
#[derive(Debug, Clone)]
pub struct BootTemplate {
    tera: Tera,
}

impl BootTemplate {
    /// The template shipped with the controller.
    pub fn builtin() -> Result<Self, TemplateError> {
        Self::new(BUILTIN_USER_DATA)
    }

    pub fn new(source: &str) -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        // cloud-config is YAML; nothing is escaped.
        tera.autoescape_on(Vec::new());
        tera.add_raw_template(TEMPLATE_NAME, source)
            .map_err(TemplateError::Syntax)?;
        Ok(Self { tera })
    }

    /// Load and compile a template from disk.
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(&source)
    }

    /// Use the file at `path` if given, otherwise the built-in template.
    pub fn load(path: Option<&Path>) -> Result<Self, TemplateError> {
        path.map_or_else(Self::builtin, Self::from_file)
    }

    /// Render for one runner. Values are inserted verbatim and never
    /// evaluated as template code.
    pub fn render(&self, name: &str, jitconfig: &str) -> Result<String, TemplateError> {
        let mut context = Context::new();
        context.insert("name", name);
        context.insert("jitconfig", jitconfig);
        self.tera
            .render(TEMPLATE_NAME, &context)
            .map_err(TemplateError::Render)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[test]
    fn test_builtin_template() {
        let rendered = BootTemplate::builtin()
            .unwrap()
            .render("gha-runner-100", "ZXhhbXBsZQ==")
            .unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("hostname: gha-runner-100\n"));
        assert!(rendered.contains("run.sh --jitconfig ZXhhbXBsZQ==\n"));
        assert!(rendered.contains("v${version}"));
        assert!(!rendered.contains("{{"));
    }

    #[rstest]
    #[case("host {{name}}", "host r1")]
    #[case("{{ name }}/{{jitconfig}}", "r1/J")]
    #[case("{% if jitconfig %}run {{ jitconfig }}{% endif %}", "run J")]
    #[case("no placeholders", "no placeholders")]
    fn test_render(#[case] template: &str, #[case] expected: &str) {
        let template = BootTemplate::new(template).unwrap();
        assert_eq!(template.render("r1", "J").unwrap(), expected);
    }

    #[test]
    fn test_values_are_not_expanded() {
        let template = BootTemplate::new("{{name}} {{jitconfig}}").unwrap();
        let rendered = template.render("{{jitconfig}}", "<a&b>").unwrap();
        assert_eq!(rendered, "{{jitconfig}} <a&b>");
    }

    #[test]
    fn test_syntax_error_fails_at_load() {
        let result = BootTemplate::new("hostname: {{name");
        assert!(matches!(result, Err(TemplateError::Syntax(_))));
    }

    #[test]
    fn test_undefined_variable_fails_render() {
        let template = BootTemplate::new("{{name}} {{hostname}}").unwrap();
        let result = template.render("r1", "J");
        assert!(matches!(result, Err(TemplateError::Render(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("runnerpool-template-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("user-data");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#cloud-config\nhostname: {{{{name}}}}").unwrap();

        let template = BootTemplate::load(Some(&path)).unwrap();
        assert_eq!(template.render("r9", "").unwrap(), "#cloud-config\nhostname: r9\n");

        let missing = BootTemplate::load(Some(&dir.join("missing")));
        assert!(matches!(missing, Err(TemplateError::Read { .. })));

        let builtin = BootTemplate::load(None).unwrap().render("r9", "J").unwrap();
        assert!(builtin.contains("hostname: r9\n"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
