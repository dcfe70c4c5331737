//! Script repository for the atomic algorithm programs.
//!
//! Program text is read once per name and cached for the life of the
//! repository. Only the text is cached; no rate-limit state ever is.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::algorithm::Algorithm;
use crate::error::{LimiterError, Result};

const FIXED_WINDOW_LUA: &str = include_str!("../../scripts/fixed_window.lua");
const SLIDING_WINDOW_LUA: &str = include_str!("../../scripts/sliding_window.lua");
const TOKEN_BUCKET_LUA: &str = include_str!("../../scripts/token_bucket.lua");

/// File name of the program implementing `algorithm`.
pub fn script_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::FixedWindow => "fixed_window.lua",
        Algorithm::SlidingWindow => "sliding_window.lua",
        Algorithm::TokenBucket => "token_bucket.lua",
    }
}

/// Where program text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// The programs compiled into the crate
    Builtin,
    /// `<dir>/<name>` on the local filesystem
    Directory(PathBuf),
}

/// A loaded program, ready to hand to an executor.
#[derive(Debug, Clone)]
pub struct Program {
    /// The algorithm this program implements
    pub algorithm: Algorithm,
    /// Program text
    pub text: Arc<str>,
}

/// Caches algorithm programs by name.
///
/// Safe to share across tasks. Two tasks racing on first use may both read
/// the source, but only a complete read is ever inserted.
#[derive(Debug)]
pub struct ScriptRepository {
    source: ScriptSource,
    cache: DashMap<String, Arc<str>>,
}

impl ScriptRepository {
    pub fn new(source: ScriptSource) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    /// Repository serving the built-in programs.
    pub fn builtin() -> Self {
        Self::new(ScriptSource::Builtin)
    }

    pub fn source(&self) -> &ScriptSource {
        &self.source
    }

    /// Load the program text for `name`, reading it on first use.
    pub fn load(&self, name: &str) -> Result<Arc<str>> {
        if let Some(text) = self.cache.get(name) {
            return Ok(text.clone());
        }

        let text: Arc<str> = self.read(name)?.into();
        debug!(name = %name, bytes = text.len(), "Loaded script");

        // Keep whichever complete copy landed first.
        let cached = self
            .cache
            .entry(name.to_string())
            .or_insert(text)
            .clone();
        Ok(cached)
    }

    /// Load the program for `algorithm`.
    pub fn program(&self, algorithm: Algorithm) -> Result<Program> {
        Ok(Program {
            algorithm,
            text: self.load(script_name(algorithm))?,
        })
    }

    /// Load every algorithm program, failing on the first one missing.
    pub fn preload(&self) -> Result<()> {
        for algorithm in Algorithm::ALL {
            self.program(algorithm)?;
        }
        info!(source = ?self.source, "All rate limit scripts loaded");
        Ok(())
    }

    /// Number of cached programs.
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn read(&self, name: &str) -> Result<String> {
        match &self.source {
            ScriptSource::Builtin => builtin(name).map(str::to_string).ok_or_else(|| {
                LimiterError::Script {
                    name: name.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no built-in script with this name",
                    ),
                }
            }),
            ScriptSource::Directory(dir) => {
                std::fs::read_to_string(dir.join(name)).map_err(|source| LimiterError::Script {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

impl Default for ScriptRepository {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin(name: &str) -> Option<&'static str> {
    match name {
        "fixed_window.lua" => Some(FIXED_WINDOW_LUA),
        "sliding_window.lua" => Some(SLIDING_WINDOW_LUA),
        "token_bucket.lua" => Some(TOKEN_BUCKET_LUA),
        _ => None,
    }
}
