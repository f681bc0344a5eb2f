// SPDX-License-Identifier: MIT

//! Package manifest reader.
//!
//! Only the fields the sandbox agent needs are read: the app title and the
//! continue command.  Everything else in the manifest is skipped.

pub mod wire;

use std::path::Path;

use crate::error::ManifestError;

use wire::{Builder, Message};

const MANIFEST_DATA_WORDS: u16 = 2;
const MANIFEST_POINTERS: u16 = 5;
const MANIFEST_CONTINUE_COMMAND: u16 = 1;
const MANIFEST_APP_TITLE: u16 = 3;

const COMMAND_POINTERS: u16 = 3;
const COMMAND_ARGV: u16 = 0;
const COMMAND_ENVIRON: u16 = 2;

const LOCALIZED_TEXT_POINTERS: u16 = 2;
const LOCALIZED_TEXT_DEFAULT: u16 = 0;

const KEY_VALUE_POINTERS: u16 = 2;
const KEY_VALUE_KEY: u16 = 0;
const KEY_VALUE_VALUE: u16 = 1;

/// The launch-relevant part of a package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Default text of the localized title.  Empty when the package has none.
    pub app_title: String,
    pub continue_command: Command,
}

/// A command line and the complete environment to run it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Never empty; the first element is the executable.
    pub args: Vec<String>,
    /// `KEY=value` entries, in manifest order.
    pub env: Vec<String>,
}

impl Command {
    /// Split each entry at its first `=`.  An entry without one becomes a
    /// variable with an empty value.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }
}

impl Manifest {
    /// Read and decode the manifest file at `path`.
    pub fn read(path: &Path) -> Result<Manifest, ManifestError> {
        let data = std::fs::read(path)?;
        Manifest::decode(&data)
    }

    pub fn decode(data: &[u8]) -> Result<Manifest, ManifestError> {
        let msg = Message::from_bytes(data)?;
        let root = msg
            .root()?
            .ok_or_else(|| ManifestError::malformed("manifest is empty"))?;

        let app_title = match root.struct_field(MANIFEST_APP_TITLE)? {
            Some(title) => title
                .text_field(LOCALIZED_TEXT_DEFAULT)?
                .unwrap_or_default(),
            None => String::new(),
        };

        let command = root
            .struct_field(MANIFEST_CONTINUE_COMMAND)?
            .ok_or_else(|| ManifestError::malformed("manifest has no continue command"))?;
        let args = match command.list_field(COMMAND_ARGV)? {
            Some(argv) => argv.texts()?,
            None => Vec::new(),
        };
        if args.is_empty() {
            return Err(ManifestError::malformed("continue command has an empty argv"));
        }

        let mut env = Vec::new();
        if let Some(environ) = command.list_field(COMMAND_ENVIRON)? {
            for i in 0..environ.len() {
                let kv = environ.struct_at(i)?;
                let key = kv.text_field(KEY_VALUE_KEY)?.unwrap_or_default();
                let value = kv.text_field(KEY_VALUE_VALUE)?.unwrap_or_default();
                env.push(format!("{key}={value}"));
            }
        }

        Ok(Manifest {
            app_title,
            continue_command: Command { args, env },
        })
    }

    /// Encode as a single-segment message.
    ///
    /// Environment entries are split at their first `=`; an entry without
    /// one has no key-value form and is rejected.
    pub fn encode(&self) -> Result<Vec<u8>, ManifestError> {
        if let Some(entry) = self.continue_command.env.iter().find(|e| !e.contains('=')) {
            return Err(ManifestError::malformed(format!(
                "environment entry {entry:?} has no '='"
            )));
        }
        let mut b = Builder::new(MANIFEST_DATA_WORDS, MANIFEST_POINTERS);
        let root = 1;

        let title = b.init_struct(
            Builder::field(root, MANIFEST_DATA_WORDS, MANIFEST_APP_TITLE),
            0,
            LOCALIZED_TEXT_POINTERS,
        );
        b.set_text(
            Builder::field(title, 0, LOCALIZED_TEXT_DEFAULT),
            &self.app_title,
        );

        let command = b.init_struct(
            Builder::field(root, MANIFEST_DATA_WORDS, MANIFEST_CONTINUE_COMMAND),
            0,
            COMMAND_POINTERS,
        );
        b.set_text_list(
            Builder::field(command, 0, COMMAND_ARGV),
            &self.continue_command.args,
        );
        let pairs = self.continue_command.env_pairs();
        let entries = b.init_struct_list(
            Builder::field(command, 0, COMMAND_ENVIRON),
            pairs.len(),
            0,
            KEY_VALUE_POINTERS,
        );
        for (at, (key, value)) in entries.into_iter().zip(pairs) {
            b.set_text(Builder::field(at, 0, KEY_VALUE_KEY), &key);
            b.set_text(Builder::field(at, 0, KEY_VALUE_VALUE), &value);
        }

        Ok(b.finish())
    }
}
