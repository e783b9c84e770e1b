//! Rendering of `conan create` invocations for matrix entries.

use serde::{Deserialize, Serialize};

use crate::entry::BuildEntry;
use crate::reference::PackageReference;

/// How to invoke Conan for each entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConanInvocation {
    /// Conan executable.
    pub program: String,
    /// Directory containing the recipe, relative to the working directory.
    pub recipe_dir: String,
    /// Package reference; entries may override it.
    pub reference: Option<PackageReference>,
    /// Value of `--build`.
    pub build_policy: String,
    /// Appended verbatim after the generated arguments.
    pub extra_args: Vec<String>,
}

impl Default for ConanInvocation {
    fn default() -> Self {
        Self {
            program: "conan".to_string(),
            recipe_dir: ".".to_string(),
            reference: None,
            build_policy: "missing".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl ConanInvocation {
    pub fn new(recipe_dir: impl Into<String>, reference: Option<PackageReference>) -> Self {
        Self {
            recipe_dir: recipe_dir.into(),
            reference,
            ..Default::default()
        }
    }

    /// Full argv (program included) that builds `entry`.
    pub fn create_command(&self, entry: &BuildEntry) -> Vec<String> {
        let mut cmd = vec![
            self.program.clone(),
            "create".to_string(),
            self.recipe_dir.clone(),
        ];

        if let Some(reference) = entry.reference.as_ref().or(self.reference.as_ref()) {
            // Conan wants a trailing '@' for references without user/channel
            if reference.user_channel().is_some() {
                cmd.push(reference.to_string());
            } else {
                cmd.push(format!("{}@", reference));
            }
        }

        for (key, value) in &entry.settings {
            cmd.push("-s".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        for (key, value) in &entry.options {
            cmd.push("-o".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        for (key, value) in &entry.env_vars {
            cmd.push("-e".to_string());
            cmd.push(format!("{}={}", key, value));
        }

        cmd.push(format!("--build={}", self.build_policy));
        cmd.extend(self.extra_args.iter().cloned());
        cmd
    }

    /// The command as a single shell-quoted line, for display.
    pub fn shell_line(&self, entry: &BuildEntry) -> String {
        self.create_command(entry)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | '@' | '+')
        });
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> BuildEntry {
        BuildEntry::new()
            .with_setting("compiler", "gcc")
            .with_setting("compiler.libcxx", "libstdc++11")
            .with_setting("arch", "x86_64")
            .with_option("CHM:with_mpi", true)
            .with_option("boost:without_mpi", false)
    }

    #[test]
    fn test_create_command() {
        let reference: PackageReference = "CHM/1.0@chm/stable".parse().unwrap();
        let conan = ConanInvocation::new(".", Some(reference));
        let cmd = conan.create_command(&entry());

        assert_eq!(
            cmd,
            vec![
                "conan",
                "create",
                ".",
                "CHM/1.0@chm/stable",
                "-s",
                "arch=x86_64",
                "-s",
                "compiler=gcc",
                "-s",
                "compiler.libcxx=libstdc++11",
                "-o",
                "CHM:with_mpi=True",
                "-o",
                "boost:without_mpi=False",
                "--build=missing",
            ]
        );
    }

    #[test]
    fn test_each_setting_rendered_once() {
        let conan = ConanInvocation::default();
        let cmd = conan.create_command(&entry());
        let count = cmd.iter().filter(|a| a.starts_with("compiler=")).count();
        assert_eq!(count, 1);
        assert_eq!(cmd.iter().filter(|a| *a == "-s").count(), 3);
    }

    #[test]
    fn test_reference_without_user_channel_gets_at() {
        let conan = ConanInvocation::new(".", Some(PackageReference::new("CHM", "1.0")));
        let cmd = conan.create_command(&BuildEntry::new());
        assert_eq!(cmd[3], "CHM/1.0@");
    }

    #[test]
    fn test_entry_reference_overrides() {
        let conan = ConanInvocation::new(".", Some(PackageReference::new("CHM", "1.0")));
        let mut e = BuildEntry::new();
        e.reference = Some(PackageReference::new("CHM", "2.0").with_user_channel("a", "b"));
        assert_eq!(conan.create_command(&e)[3], "CHM/2.0@a/b");
    }

    #[test]
    fn test_shell_line_quotes() {
        let conan = ConanInvocation::default();
        let e = BuildEntry::new().with_env("CXXFLAGS", "-O2 -g");
        let line = conan.shell_line(&e);
        assert_eq!(line, "conan create . -e 'CXXFLAGS=-O2 -g' --build=missing");
    }
}
