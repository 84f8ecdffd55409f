//! Shader composition and permutation caching.
//!
//! # Overview
//!
//! - [`ShaderComposer`] - shared registry of program sources and include
//!   modules; expands `#include` directives and assembles per-stage GLSL
//! - [`ShaderLibrary`] - the built-in programs and modules
//! - [`MacroSet`] / [`ShaderMacro`] - typed permutation switches
//! - [`ShaderCache`] - compiles each (program, macro set) pair once
//!
//! # Include Syntax
//!
//! ```glsl
//! #include "lib/common.glsl"
//! #include <lib/lighting.glsl>
//! ```
//!
//! A module is expanded at most once per program; later includes of the
//! same path are dropped.
//!
//! # Multipass
//!
//! A program that accumulates one light per draw declares it on its own line:
//!
//! ```glsl
//! #pragma multipass
//! ```
//!
//! Programs without the pragma are shaded in a single pass.

pub mod cache;
pub mod library;
pub mod macros;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ShaderError;

pub use cache::{permutation_key, CacheStats, PermutationKey, ResolvedProgram, ShaderCache};
pub use library::ShaderLibrary;
pub use macros::{MacroSet, MacroValue, ShaderMacro};

const MULTIPASS_PRAGMA: &str = "#pragma multipass";

/// Pipeline stage a composed source is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn define(&self) -> &'static str {
        match self {
            ShaderStage::Vertex => "VERTEX",
            ShaderStage::Fragment => "FRAGMENT",
        }
    }
}

/// A program source with every include expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedShader {
    pub name: String,
    pub source: String,
    pub multipass: bool,
}

impl ExpandedShader {
    /// GLSL for one stage: the `#version` line, the stage define, the macro
    /// defines, then the body.
    pub fn compose(&self, stage: ShaderStage, macros: &MacroSet) -> String {
        let mut lines = self.source.lines();
        let mut out = String::with_capacity(self.source.len() + 256);
        let first = self
            .source
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        if first.trim_start().starts_with("#version") {
            for line in lines.by_ref() {
                out.push_str(line);
                out.push('\n');
                if line.trim_start().starts_with("#version") {
                    break;
                }
            }
        } else {
            out.push_str("#version 450\n");
        }
        out.push_str("#define ");
        out.push_str(stage.define());
        out.push('\n');
        out.push_str(&macros.to_defines());
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[derive(Default)]
struct ComposerState {
    programs: HashMap<String, String>,
    includes: HashMap<String, String>,
    generation: u64,
}

/// Shared registry of shader sources.
///
/// Cloning is cheap and every clone sees the same sources, so tooling can
/// edit sources while the renderer keeps its own handle. Each edit bumps
/// [`generation`](Self::generation).
#[derive(Clone, Default)]
pub struct ShaderComposer {
    state: Arc<RwLock<ComposerState>>,
}

impl ShaderComposer {
    /// Create a new empty shader composer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shader composer with the standard library pre-loaded.
    pub fn with_standard_library() -> Self {
        let composer = Self::new();
        composer.add_library(&ShaderLibrary::standard());
        composer
    }

    /// Register every program and module of a library.
    pub fn add_library(&self, library: &ShaderLibrary) {
        let mut state = self.state.write();
        for (name, source) in library.programs() {
            state.programs.insert(name.to_string(), source.to_string());
        }
        for (path, source) in library.modules() {
            state.includes.insert(path.to_string(), source.to_string());
        }
        state.generation += 1;
    }

    /// Add or replace a program source.
    pub fn set_source(&self, name: &str, source: &str) {
        let mut state = self.state.write();
        state.programs.insert(name.to_string(), source.to_string());
        state.generation += 1;
        log::debug!("Shader source '{}' updated (generation {})", name, state.generation);
    }

    /// Add or replace an include module.
    pub fn register_include(&self, path: &str, source: &str) {
        let mut state = self.state.write();
        state.includes.insert(path.to_string(), source.to_string());
        state.generation += 1;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().programs.contains_key(name)
    }

    /// Counter bumped by every source or module change.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Expand the includes of a program.
    pub fn expand(&self, name: &str) -> Result<ExpandedShader, ShaderError> {
        let state = self.state.read();
        let source = state
            .programs
            .get(name)
            .ok_or_else(|| ShaderError::UnknownShader(name.to_string()))?;

        let multipass = source.lines().any(|l| l.trim() == MULTIPASS_PRAGMA);
        let mut included = HashSet::new();
        let expanded = resolve_includes(&state.includes, source, &mut included)?;
        Ok(ExpandedShader {
            name: name.to_string(),
            source: expanded,
            multipass,
        })
    }
}

/// Resolve `#include "path"` directives recursively.
fn resolve_includes(
    includes: &HashMap<String, String>,
    source: &str,
    included: &mut HashSet<String>,
) -> Result<String, ShaderError> {
    let mut result = String::with_capacity(source.len());

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed == MULTIPASS_PRAGMA {
            continue;
        }
        if let Some(path) = parse_include_directive(trimmed) {
            if !included.insert(path.to_string()) {
                continue;
            }
            let include_source = includes
                .get(path)
                .ok_or_else(|| ShaderError::IncludeNotFound(path.to_string()))?;
            let resolved = resolve_includes(includes, include_source, included)?;
            result.push_str(&resolved);
            result.push('\n');
        } else {
            result.push_str(line);
            result.push('\n');
        }
    }

    Ok(result)
}

/// Parse a `#include "path"` directive, returning the path if found.
fn parse_include_directive(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("#include")?;
    let rest = rest.trim();
    if let Some(inner) = rest.strip_prefix('"') {
        inner.strip_suffix('"')
    } else if let Some(inner) = rest.strip_prefix('<') {
        inner.strip_suffix('>')
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_is_expanded_once() {
        let composer = ShaderComposer::new();
        composer.register_include("lib/a.glsl", "float a() { return 1.0; }");
        composer.register_include("lib/b.glsl", "#include \"lib/a.glsl\"\nfloat b() { return a(); }");
        composer.set_source(
            "test",
            "#version 450\n#include \"lib/a.glsl\"\n#include <lib/b.glsl>\nvoid main() {}",
        );
        let expanded = composer.expand("test").unwrap();
        assert_eq!(expanded.source.matches("float a()").count(), 1);
        assert!(expanded.source.contains("float b()"));
    }

    #[test]
    fn missing_include_is_reported() {
        let composer = ShaderComposer::new();
        composer.set_source("test", "#include \"nope.glsl\"");
        assert_eq!(
            composer.expand("test"),
            Err(ShaderError::IncludeNotFound("nope.glsl".into()))
        );
    }

    #[test]
    fn multipass_pragma_is_detected_and_stripped() {
        let composer = ShaderComposer::with_standard_library();
        let phong = composer.expand("phong").unwrap();
        assert!(phong.multipass);
        assert!(!phong.source.contains("#pragma multipass"));
        assert!(!composer.expand("flat").unwrap().multipass);
        assert!(!composer.expand("fallback").unwrap().multipass);
    }

    #[test]
    fn defines_follow_version_line() {
        let composer = ShaderComposer::new();
        composer.set_source("test", "#version 450\nvoid main() {}");
        let expanded = composer.expand("test").unwrap();
        let macros = MacroSet::new().with_flag(ShaderMacro::UseDiffuse);
        let glsl = expanded.compose(ShaderStage::Fragment, &macros);
        let lines: Vec<&str> = glsl.lines().collect();
        assert_eq!(lines[0], "#version 450");
        assert_eq!(lines[1], "#define FRAGMENT");
        assert_eq!(lines[2], "#define USE_DIFFUSE");
    }

    #[test]
    fn edits_bump_generation() {
        let composer = ShaderComposer::with_standard_library();
        let shared = composer.clone();
        let before = composer.generation();
        shared.set_source("flat", "#version 450\nvoid main() {}");
        assert!(composer.generation() > before);
    }
}
