use std::{collections::BTreeMap, str::FromStr};

use crate::sandbox::SourceFile;

const PYTHON_DRIVER: &str = include_str!("drivers/runner.py");
const JAVASCRIPT_DRIVER: &str = include_str!("drivers/runner.js");
const JAVA_DRIVER: &str = include_str!("drivers/Main.java");
const JAVA_CODE_SLOT: &str = "{{USER_CODE}}";

/// Languages the engine knows how to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Runtime {
    Python,
    Java,
    JavaScript,
}

impl Runtime {
    pub const ALL: [Runtime; 3] = [Runtime::Python, Runtime::Java, Runtime::JavaScript];

    pub fn name(&self) -> &'static str {
        match self {
            Runtime::Python => "python",
            Runtime::Java => "java",
            Runtime::JavaScript => "javascript",
        }
    }

    fn default_image(&self) -> &'static str {
        match self {
            Runtime::Python => "python:3.11",
            Runtime::Java => "openjdk:17",
            Runtime::JavaScript => "node:20",
        }
    }

    fn default_command(&self) -> &'static [&'static str] {
        match self {
            Runtime::Python => &["python3", "runner.py"],
            Runtime::Java => &["java", "-Dfile.encoding=UTF-8", "Main.java"],
            Runtime::JavaScript => &["node", "runner.js"],
        }
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "java" => Ok(Self::Java),
            "javascript" | "js" => Ok(Self::JavaScript),
            _ => Err(format!("unsupported runtime: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    pub runtime: Runtime,
    pub image: String,
    pub command: Vec<String>,
}

impl RuntimeSpec {
    pub fn with_defaults(runtime: Runtime) -> Self {
        Self {
            runtime,
            image: runtime.default_image().to_string(),
            command: runtime
                .default_command()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// User program wrapped into the runtime's entry point, plus its driver.
    pub fn source_files(&self, code: &str) -> Vec<SourceFile> {
        match self.runtime {
            Runtime::Python => vec![
                SourceFile::new("main.py", wrap_python(code)),
                SourceFile::new("runner.py", PYTHON_DRIVER),
            ],
            Runtime::JavaScript => vec![
                SourceFile::new("main.js", wrap_javascript(code)),
                SourceFile::new("runner.js", JAVASCRIPT_DRIVER),
            ],
            // single-file source launch cannot see sibling files
            Runtime::Java => vec![SourceFile::new(
                "Main.java",
                JAVA_DRIVER.replace(JAVA_CODE_SLOT, &indent(code, 8)),
            )],
        }
    }
}

fn wrap_python(code: &str) -> String {
    format!("def solve(input_str):\n{}\n", indent(code, 4))
}

fn wrap_javascript(code: &str) -> String {
    format!("function solve(input_str) {{\n{code}\n}}\n\nmodule.exports = {{ solve }};\n")
}

fn indent(code: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    code.lines()
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The configured, closed set of supported runtimes.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    specs: BTreeMap<Runtime, RuntimeSpec>,
}

impl RuntimeRegistry {
    pub fn new(specs: impl IntoIterator<Item = RuntimeSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.runtime, s)).collect(),
        }
    }

    pub fn resolve(&self, language: &str) -> Option<&RuntimeSpec> {
        let runtime = language.parse::<Runtime>().ok()?;
        self.specs.get(&runtime)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.keys().map(Runtime::name).collect()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new(Runtime::ALL.into_iter().map(RuntimeSpec::with_defaults))
    }
}

#[cfg(test)]
mod tests {
    use super::{Runtime, RuntimeRegistry, RuntimeSpec};

    #[test]
    fn python_body_is_indented_under_solve() {
        let spec = RuntimeSpec::with_defaults(Runtime::Python);
        let files = spec.source_files("n = int(input_str)\nreturn n * n");
        assert_eq!(files[0].name, "main.py");
        assert_eq!(
            files[0].contents,
            "def solve(input_str):\n    n = int(input_str)\n    return n * n\n"
        );
        assert_eq!(files[1].name, "runner.py");
        assert!(files[1].contents.contains("from main import solve"));
    }

    #[test]
    fn javascript_exports_solve() {
        let spec = RuntimeSpec::with_defaults(Runtime::JavaScript);
        let files = spec.source_files("return input_str.length;");
        assert!(files[0].contents.starts_with("function solve(input_str) {\n"));
        assert!(files[0].contents.contains("module.exports = { solve };"));
        assert_eq!(files[1].name, "runner.js");
    }

    #[test]
    fn java_code_is_spliced_into_single_file() {
        let spec = RuntimeSpec::with_defaults(Runtime::Java);
        let files = spec.source_files("return input_str.toUpperCase();");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "Main.java");
        assert!(
            files[0]
                .contents
                .contains("        return input_str.toUpperCase();")
        );
        assert!(!files[0].contents.contains("{{USER_CODE}}"));
    }

    #[test]
    fn resolve_respects_enabled_set() {
        let registry = RuntimeRegistry::new([RuntimeSpec::with_defaults(Runtime::Python)]);
        assert!(registry.resolve("Python").is_some());
        assert!(registry.resolve("java").is_none());
        assert!(registry.resolve("cobol").is_none());
        assert_eq!(registry.names(), vec!["python"]);
    }

    #[test]
    fn default_registry_covers_every_runtime() {
        let registry = RuntimeRegistry::default();
        let js = registry.resolve("js").unwrap();
        assert_eq!(js.image, "node:20");
        assert_eq!(js.command, vec!["node", "runner.js"]);
        assert_eq!(registry.names().len(), 3);
    }
}
