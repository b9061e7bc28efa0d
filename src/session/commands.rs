//! Canned responses for the fake shell

use std::borrow::Cow;
use std::collections::HashMap;

use crate::config::Config;

const BUILTIN: &[(&str, &str)] = &[("ls", "users.txt"), ("pwd", "/home/root")];

/// Leading token -> response text. Read-only once built.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: HashMap<String, String>,
    unknown: String,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            entries: BUILTIN
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            unknown: String::new(),
        }
    }
}

impl CommandTable {
    /// Built-ins plus `[commands]` entries, which win on conflict.
    pub fn from_config(config: &Config) -> Self {
        let mut table = Self::default();
        for (command, response) in &config.commands {
            table.entries.insert(command.clone(), response.clone());
        }
        table.unknown = config.emulation.unknown_command.clone();
        table
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Response for a finalized line. Empty means nothing is written.
    ///
    /// `{command}` in the unknown-command text expands to the leading token.
    pub fn respond(&self, line: &str) -> Cow<'_, str> {
        let Some(command) = line.split_whitespace().next() else {
            return Cow::Borrowed("");
        };
        match self.entries.get(command) {
            Some(response) => Cow::Borrowed(response.as_str()),
            None if self.unknown.contains("{command}") => {
                Cow::Owned(self.unknown.replace("{command}", command))
            }
            None => Cow::Borrowed(self.unknown.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_responses() {
        let table = CommandTable::default();
        assert_eq!(table.respond("ls"), "users.txt");
        assert_eq!(table.respond("pwd"), "/home/root");
        assert_eq!(table.respond("foobar"), "");
        assert_eq!(table.respond(""), "");
    }

    #[test]
    fn matches_leading_token_only() {
        let table = CommandTable::default();
        assert_eq!(table.respond("ls -la /tmp"), "users.txt");
        assert_eq!(table.respond("lsblk"), "");
        assert_eq!(table.respond("echo ls"), "");
    }

    #[test]
    fn config_extends_and_overrides() {
        let mut config = Config::default();
        config.commands.insert("whoami".to_string(), "root".to_string());
        config.commands.insert("ls".to_string(), "notes.txt".to_string());
        let table = CommandTable::from_config(&config);

        assert_eq!(table.entry_count(), 3);
        assert_eq!(table.respond("whoami"), "root");
        assert_eq!(table.respond("ls"), "notes.txt");
        assert_eq!(table.respond("pwd"), "/home/root");
    }

    #[test]
    fn unknown_command_text_is_configurable() {
        let mut config = Config::default();
        config.emulation.unknown_command = "-bash: {command}: command not found".to_string();
        let table = CommandTable::from_config(&config);

        assert_eq!(
            table.respond("nmap -sS 10.0.0.0/8"),
            "-bash: nmap: command not found"
        );
        assert_eq!(table.respond("ls"), "users.txt");
        assert_eq!(table.respond("   "), "");
    }

    #[test]
    fn responses_do_not_depend_on_history() {
        let table = CommandTable::default();
        let first: Vec<String> = ["ls", "foobar", "pwd"]
            .iter()
            .map(|c| table.respond(c).into_owned())
            .collect();
        let second: Vec<String> = ["pwd", "ls", "foobar"]
            .iter()
            .map(|c| table.respond(c).into_owned())
            .collect();
        assert_eq!(first, vec!["users.txt", "", "/home/root"]);
        assert_eq!(second, vec!["/home/root", "users.txt", ""]);
    }
}
