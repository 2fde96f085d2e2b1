use crate::{agent::SourceTree, context::ContextSlice};

/// Runner configuration that sits next to tests but is not a test.
const NON_TEST_CONFIGS: &[&str] = &[
    "pytest.ini",
    "conftest.py",
    "setup.cfg",
    "tox.ini",
    "pyproject.toml",
    "package.json",
    "jest.config.js",
    "jest.config.ts",
    "vitest.config.ts",
    "vitest.config.js",
    "karma.conf.js",
    ".coveragerc",
    "__init__.py",
];

/// Conventional test directories, in preference order.
const TEST_DIRS: &[&str] = &["tests", "test", "__tests__", "spec"];

/// Extensions of files a test runner can execute.
const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "rs", "rb", "java", "kt", "php", "cs", "c", "cc", "cpp",
    "swift", "scala", "ex", "exs", "sh",
];

/// Dependency manifests and the command that installs from each.
const MANIFESTS: &[(&str, &str)] = &[
    ("requirements.txt", "pip install -r requirements.txt"),
    ("requirements-dev.txt", "pip install -r requirements-dev.txt"),
    ("pyproject.toml", "pip install -e ."),
    ("setup.py", "pip install -e ."),
    ("Pipfile", "pipenv install --dev"),
    ("package.json", "npm install"),
    ("Cargo.toml", "cargo fetch"),
    ("go.mod", "go mod download"),
];

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn is_non_test_config(path: &str) -> bool {
    NON_TEST_CONFIGS.contains(&file_name(path))
}

/// Heuristic test-file detection across the ecosystems the sandbox runs.
pub fn is_test_file(path: &str) -> bool {
    if is_non_test_config(path) {
        return false;
    }
    let name = file_name(path);
    let in_test_dir = path
        .split('/')
        .rev()
        .skip(1)
        .any(|seg| TEST_DIRS.contains(&seg));
    let named_like_test = name.starts_with("test_")
        || name.ends_with("_test.py")
        || name.ends_with("_test.go")
        || name.ends_with("_test.rs")
        || name.contains(".test.")
        || name.contains(".spec.");
    let source_like = name
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext));
    named_like_test || (in_test_dir && source_like)
}

/// Quote `s` for `sh -c` unless it is made only of characters the shell
/// leaves alone.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ','));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn shell_join(paths: &[&str]) -> String {
    paths.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
}

/// Pick the test target for a change.
///
/// Touched test files win, then test files named in the context slice, then
/// a conventional test directory. `Err` carries the diagnostic when nothing
/// resembles a test.
pub fn infer_test_target(
    affected: &[String],
    slice: &ContextSlice,
    tree: &dyn SourceTree,
) -> Result<String, String> {
    let touched: Vec<&str> = affected
        .iter()
        .map(String::as_str)
        .filter(|p| is_test_file(p))
        .collect();
    if !touched.is_empty() {
        return Ok(shell_join(&touched));
    }

    let from_context: Vec<&str> = slice
        .files
        .iter()
        .map(String::as_str)
        .filter(|p| is_test_file(p))
        .collect();
    if !from_context.is_empty() {
        return Ok(shell_join(&from_context));
    }

    if let Some(dir) = TEST_DIRS.iter().find(|d| tree.has_dir(d)) {
        return Ok(format!("{dir}/"));
    }

    Err(format!(
        "No test target found: none of [{}] is a test file and the repository has no {} directory",
        affected.join(", "),
        TEST_DIRS.join("/, ") + "/"
    ))
}

/// Install commands for every manifest the change touches, deduplicated.
pub fn install_commands(affected: &[String]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for path in affected {
        let name = file_name(path);
        if let Some((_, cmd)) = MANIFESTS.iter().find(|(m, _)| *m == name) {
            if !out.contains(cmd) {
                out.push(cmd);
            }
        }
    }
    out
}
