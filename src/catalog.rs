//! The static tool catalog.
//!
//! A single table of records keyed by tool name, each carrying everything
//! the Runner Enforcer and Tool Atomifier need to make a decision without
//! re-deriving it from the command vector, rather than string-matching
//! scattered across both components.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// The five launchers trusted to be serial-safe. No other launcher prefix
/// is ever treated as canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Launcher {
    Uv,
    Pipx,
    Pnpm,
    Go,
    Npx,
}

impl Launcher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Launcher::Uv => "uv",
            Launcher::Pipx => "pipx",
            Launcher::Pnpm => "pnpm",
            Launcher::Go => "go",
            Launcher::Npx => "npx",
        }
    }

    pub fn from_str(s: &str) -> Option<Launcher> {
        match s {
            "uv" => Some(Launcher::Uv),
            "pipx" => Some(Launcher::Pipx),
            "pnpm" => Some(Launcher::Pnpm),
            "go" => Some(Launcher::Go),
            "npx" => Some(Launcher::Npx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageFamily {
    Python,
    Node,
    Go,
    Other,
}

/// How a tool's target files/tests are split into atomic invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomizationRule {
    None,
    PerFile,
    PerDirectory,
    PerTest,
    /// Tier-2, gated behind `--enable-second-tier`.
    PerTestMethod,
}

/// Where file arguments live in the command vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileArgPosition {
    /// Trailing non-flag tokens.
    End,
    /// For `uv run <tool> ...`: scan after the tool name.
    AfterTool,
    /// For `pre-commit run --files ...`: scan after the named flag.
    AfterFilesFlag(&'static str),
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub tier: Tier,
    pub preferred_launcher: Option<Launcher>,
    pub language_family: LanguageFamily,
    pub atomization_rule: AtomizationRule,
    pub extensions: &'static [&'static str],
    pub ignore_files: &'static [&'static str],
    pub file_arg_position: FileArgPosition,
    /// Tokens immediately after the tool name that are subcommands, not
    /// file arguments (e.g. `ruff check`, `ruff format`).
    pub known_subcommands: &'static [&'static str],
}

pub static CATALOG: Lazy<HashMap<&'static str, ToolSpec>> = Lazy::new(|| {
    let specs = [
        ToolSpec {
            name: "pytest",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Uv),
            language_family: LanguageFamily::Python,
            atomization_rule: AtomizationRule::PerTest,
            extensions: &["py"],
            ignore_files: &[".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &[],
        },
        ToolSpec {
            name: "ruff",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Uv),
            language_family: LanguageFamily::Python,
            atomization_rule: AtomizationRule::PerFile,
            extensions: &["py", "pyi"],
            ignore_files: &[".ruffignore", ".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &["check", "format"],
        },
        ToolSpec {
            name: "mypy",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Uv),
            language_family: LanguageFamily::Python,
            atomization_rule: AtomizationRule::PerFile,
            extensions: &["py", "pyi"],
            ignore_files: &[".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &[],
        },
        ToolSpec {
            name: "unittest",
            tier: Tier::Second,
            preferred_launcher: Some(Launcher::Uv),
            language_family: LanguageFamily::Python,
            atomization_rule: AtomizationRule::PerTestMethod,
            extensions: &["py"],
            ignore_files: &[".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &[],
        },
        ToolSpec {
            name: "pre-commit",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Pipx),
            language_family: LanguageFamily::Other,
            atomization_rule: AtomizationRule::PerFile,
            extensions: &[],
            ignore_files: &[".gitignore"],
            file_arg_position: FileArgPosition::AfterFilesFlag("--files"),
            known_subcommands: &["run"],
        },
        ToolSpec {
            name: "eslint",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Npx),
            language_family: LanguageFamily::Node,
            atomization_rule: AtomizationRule::PerFile,
            extensions: &["js", "jsx", "ts", "tsx"],
            ignore_files: &[".eslintignore", ".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &[],
        },
        ToolSpec {
            name: "prettier",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Npx),
            language_family: LanguageFamily::Node,
            atomization_rule: AtomizationRule::PerFile,
            extensions: &["js", "jsx", "ts", "tsx", "json", "css", "md"],
            ignore_files: &[".prettierignore", ".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &[],
        },
        ToolSpec {
            name: "npm",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Pnpm),
            language_family: LanguageFamily::Node,
            atomization_rule: AtomizationRule::None,
            extensions: &[],
            ignore_files: &[],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &["run"],
        },
        ToolSpec {
            name: "pnpm",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Pnpm),
            language_family: LanguageFamily::Node,
            atomization_rule: AtomizationRule::None,
            extensions: &[],
            ignore_files: &[],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &["run"],
        },
        ToolSpec {
            name: "go",
            tier: Tier::First,
            preferred_launcher: Some(Launcher::Go),
            language_family: LanguageFamily::Go,
            atomization_rule: AtomizationRule::None,
            extensions: &["go"],
            ignore_files: &[".gitignore"],
            file_arg_position: FileArgPosition::End,
            known_subcommands: &["test", "vet", "build", "run"],
        },
    ];
    specs.into_iter().map(|s| (s.name, s)).collect()
});

/// Look up a tool by its bare name (e.g. `"ruff"`, not `"uv"`).
pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.get(name)
}

/// Universal exclusion set applied during directory expansion, regardless
/// of tool.
pub const UNIVERSAL_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "node_modules",
    "build",
    "dist",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".tox",
    "target",
];
