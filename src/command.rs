//! Container command assembly
//!
//! The container command is a small `/bin/sh -c` script composing three
//! phases: optional pre-hook, the main program, optional post-hook. The
//! script is generated from typed phases so interpreter selection stays
//! exhaustive, and it always exits with the main program's exit code;
//! hook outcomes are only reported as labelled log lines.

use std::fmt::Write as _;
use std::path::Path;

/// Mount point of the program directory inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Mount point of the hooks directory inside the container.
pub const ACTIONS_DIR: &str = "/actions";

const PRE_HOOK_LABEL: &str = "[ACT_BEFORE]";
const POST_HOOK_LABEL: &str = "[ACT_AFTER]";

/// Interpreter chosen from the entry file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Python,
    Node,
    Shell,
}

impl Interpreter {
    /// `.py` runs under python, `.js` under node, anything else under bash.
    pub fn for_file(file: &Path) -> Self {
        match file.extension().and_then(|e| e.to_str()) {
            Some("py") => Interpreter::Python,
            Some("js") => Interpreter::Node,
            _ => Interpreter::Shell,
        }
    }

    fn binary(self) -> &'static str {
        match self {
            Interpreter::Python => "python3",
            Interpreter::Node => "node",
            Interpreter::Shell => "bash",
        }
    }
}

/// A hook script resolved on the host, addressed by its container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub file_name: String,
    pub interpreter: Interpreter,
}

impl Hook {
    /// Probe `actions_dir` for `<stem>.py`, `<stem>.js`, `<stem>.sh`, in
    /// that order. Extension selection mirrors the main-file rules.
    pub fn probe(actions_dir: &Path, stem: &str) -> Option<Self> {
        for ext in ["py", "js", "sh"] {
            let file_name = format!("{stem}.{ext}");
            let candidate = actions_dir.join(&file_name);
            if candidate.is_file() {
                return Some(Self {
                    interpreter: Interpreter::for_file(&candidate),
                    file_name,
                });
            }
        }
        None
    }

    fn container_path(&self) -> String {
        format!("{ACTIONS_DIR}/{}", self.file_name)
    }
}

/// The full three-phase command for one execution.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub pre_hook: Option<Hook>,
    /// Entry file name, relative to the workspace.
    pub main_file: String,
    pub interpreter: Interpreter,
    /// Static catalog parameters, appended verbatim.
    pub static_params: Option<String>,
    pub post_hook: Option<Hook>,
}

impl CommandPlan {
    pub fn new(main_file: impl Into<String>, static_params: Option<String>) -> Self {
        let main_file = main_file.into();
        let interpreter = Interpreter::for_file(Path::new(&main_file));
        Self {
            pre_hook: None,
            main_file,
            interpreter,
            static_params,
            post_hook: None,
        }
    }

    /// Attach hooks found in `actions_dir`, when it exists.
    pub fn with_hooks(mut self, actions_dir: &Path) -> Self {
        self.pre_hook = Hook::probe(actions_dir, "act_before");
        self.post_hook = Hook::probe(actions_dir, "act_after");
        self
    }

    /// Render the container command.
    pub fn render(&self) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), self.script()]
    }

    /// The generated shell script. Hook failures never mask the main
    /// program's exit code: the script captures it immediately and exits
    /// with it after the post-hook.
    fn script(&self) -> String {
        let mut script = String::new();

        if let Some(hook) = &self.pre_hook {
            let _ = writeln!(
                script,
                "echo '{PRE_HOOK_LABEL} running {}'",
                hook.file_name
            );
            let _ = writeln!(
                script,
                "{} {}",
                hook.interpreter.binary(),
                quote(&hook.container_path())
            );
            let _ = writeln!(script, "echo \"{PRE_HOOK_LABEL} exit=$?\"");
        }

        let _ = write!(script, "{} {}", self.interpreter.binary(), quote(&self.main_file));
        if let Some(params) = &self.static_params {
            let _ = write!(script, " {params}");
        }
        let _ = writeln!(script);
        let _ = writeln!(script, "MAIN_EXIT=$?");

        if let Some(hook) = &self.post_hook {
            let _ = writeln!(
                script,
                "echo '{POST_HOOK_LABEL} running {}'",
                hook.file_name
            );
            let _ = writeln!(
                script,
                "EXIT_CODE=$MAIN_EXIT {} {}",
                hook.interpreter.binary(),
                quote(&hook.container_path())
            );
            let _ = writeln!(script, "echo \"{POST_HOOK_LABEL} exit=$?\"");
        }

        let _ = write!(script, "exit $MAIN_EXIT");
        script
    }
}

/// Single-quote a path for the shell unless it is plainly safe.
fn quote(value: &str) -> String {
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));
    if safe && !value.is_empty() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
