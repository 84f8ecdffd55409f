//! Shader permutation cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::backend::{GraphicsBackend, ProgramDescriptor, ProgramHandle};
use crate::error::{RenderError, ShaderError};
use crate::shader::library::FALLBACK_SHADER;
use crate::shader::{ExpandedShader, MacroSet, ShaderComposer, ShaderStage};

/// Hash of a base shader name and a macro set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermutationKey(pub u64);

impl PermutationKey {
    pub fn new(base: &str, macros: &MacroSet) -> Self {
        let mut hasher = DefaultHasher::new();
        base.hash(&mut hasher);
        macros.hash_into(&mut hasher);
        PermutationKey(hasher.finish())
    }
}

/// Cache key of `base` compiled with `macros`.
pub fn permutation_key(base: &str, macros: &MacroSet) -> PermutationKey {
    PermutationKey::new(base, macros)
}

/// Outcome of [`ShaderCache::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedProgram {
    pub program: ProgramHandle,
    pub key: PermutationKey,
    /// Whether the program accumulates lights one draw at a time.
    pub multipass: bool,
    /// Whether the fallback program stands in for a failed permutation.
    pub is_fallback: bool,
}

/// Counters for tooling and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiled: u64,
    pub failures: u64,
}

/// Compiles and caches one program per (base shader, macro set).
///
/// A key that fails to compile is logged once and then maps to the fallback
/// program, so it is never retried until [`clear`](Self::clear).
pub struct ShaderCache {
    composer: ShaderComposer,
    generation: u64,
    programs: HashMap<PermutationKey, ResolvedProgram>,
    expanded: HashMap<String, Result<Arc<ExpandedShader>, ShaderError>>,
    reported: HashSet<PermutationKey>,
    fallback: Option<ProgramHandle>,
    stats: CacheStats,
}

impl ShaderCache {
    pub fn new(composer: ShaderComposer) -> Self {
        let generation = composer.generation();
        Self {
            composer,
            generation,
            programs: HashMap::new(),
            expanded: HashMap::new(),
            reported: HashSet::new(),
            fallback: None,
            stats: CacheStats::default(),
        }
    }

    pub fn composer(&self) -> &ShaderComposer {
        &self.composer
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of cached permutations, fallback stand-ins included.
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Whether sources changed since the cache was last cleared.
    pub fn is_stale(&self) -> bool {
        self.composer.generation() != self.generation
    }

    /// Look up or compile the program for `base` + `macros`.
    ///
    /// Only a failure of the fallback program itself is an error.
    pub fn resolve<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        base: &str,
        macros: &MacroSet,
    ) -> Result<ResolvedProgram, RenderError> {
        let key = permutation_key(base, macros);
        if let Some(resolved) = self.programs.get(&key) {
            self.stats.hits += 1;
            return Ok(*resolved);
        }
        self.stats.misses += 1;

        let compiled = self
            .expand(base)
            .and_then(|expanded| Self::compile(backend, &expanded, macros).map(|p| (p, expanded.multipass)));

        let resolved = match compiled {
            Ok((program, multipass)) => {
                self.stats.compiled += 1;
                ResolvedProgram {
                    program,
                    key,
                    multipass,
                    is_fallback: false,
                }
            }
            Err(err) => {
                self.stats.failures += 1;
                if self.reported.insert(key) {
                    log::error!("Shader '{}' {} failed: {}", base, macros, err);
                }
                let program = self.fallback_program(backend)?;
                ResolvedProgram {
                    program,
                    key,
                    multipass: false,
                    is_fallback: true,
                }
            }
        };
        self.programs.insert(key, resolved);
        Ok(resolved)
    }

    /// The program substituted for failed permutations, compiled on first use.
    pub fn fallback_program<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<ProgramHandle, RenderError> {
        if let Some(program) = self.fallback {
            return Ok(program);
        }
        let macros = MacroSet::new();
        let expanded = self
            .expand(FALLBACK_SHADER)
            .map_err(RenderError::FallbackShaderFailed)?;
        let program =
            Self::compile(backend, &expanded, &macros).map_err(RenderError::FallbackShaderFailed)?;
        self.fallback = Some(program);
        Ok(program)
    }

    /// Destroy every cached program and forget expanded sources.
    ///
    /// Only called on an explicit shader reload.
    pub fn clear<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        let mut destroyed = HashSet::new();
        for resolved in self.programs.values() {
            if destroyed.insert(resolved.program) {
                backend.destroy_program(resolved.program);
            }
        }
        if let Some(fallback) = self.fallback.take() {
            if destroyed.insert(fallback) {
                backend.destroy_program(fallback);
            }
        }
        log::info!(
            "Shader cache cleared ({} programs destroyed)",
            destroyed.len()
        );
        self.programs.clear();
        self.expanded.clear();
        self.reported.clear();
        self.generation = self.composer.generation();
    }

    fn expand(&mut self, base: &str) -> Result<Arc<ExpandedShader>, ShaderError> {
        if let Some(cached) = self.expanded.get(base) {
            return cached.clone();
        }
        let result = self.composer.expand(base).map(Arc::new);
        self.expanded.insert(base.to_string(), result.clone());
        result
    }

    fn compile<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        expanded: &ExpandedShader,
        macros: &MacroSet,
    ) -> Result<ProgramHandle, ShaderError> {
        let desc = ProgramDescriptor {
            label: format!("{}{}", expanded.name, macros),
            vertex_source: expanded.compose(ShaderStage::Vertex, macros),
            fragment_source: expanded.compose(ShaderStage::Fragment, macros),
        };
        backend
            .compile_program(&desc)
            .map_err(|e| ShaderError::CompilationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::shader::ShaderMacro;

    #[test]
    fn key_ignores_insertion_order() {
        let a = MacroSet::new()
            .with_flag(ShaderMacro::UseDiffuse)
            .with_flag(ShaderMacro::LightOmni);
        let b = MacroSet::new()
            .with_flag(ShaderMacro::LightOmni)
            .with_flag(ShaderMacro::UseDiffuse);
        assert_eq!(PermutationKey::new("phong", &a), PermutationKey::new("phong", &b));
        assert_ne!(PermutationKey::new("phong", &a), PermutationKey::new("flat", &a));
    }

    #[test]
    fn typed_and_custom_spelling_share_a_key() {
        let typed = MacroSet::new().with_flag(ShaderMacro::UseDiffuse);
        let mut custom = MacroSet::new();
        custom.set_flag(ShaderMacro::Custom("USE_DIFFUSE".into()));
        assert_eq!(PermutationKey::new("phong", &typed), PermutationKey::new("phong", &custom));
    }

    #[test]
    fn resolve_twice_compiles_once() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut cache = ShaderCache::new(ShaderComposer::with_standard_library());
        let macros = MacroSet::new();
        let first = cache.resolve(&mut backend, "flat", &macros).unwrap();
        let second = cache.resolve(&mut backend, "flat", &macros).unwrap();
        assert_eq!(first.program, second.program);
        assert!(!first.is_fallback);
        assert_eq!(backend.programs_compiled(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn unknown_shader_maps_to_fallback_once() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut cache = ShaderCache::new(ShaderComposer::with_standard_library());
        let macros = MacroSet::new();
        let first = cache.resolve(&mut backend, "does_not_exist", &macros).unwrap();
        let second = cache.resolve(&mut backend, "does_not_exist", &macros).unwrap();
        assert!(first.is_fallback);
        assert_eq!(first.program, second.program);
        assert_eq!(cache.stats().failures, 1);
    }

    #[test]
    fn clear_destroys_programs() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut cache = ShaderCache::new(ShaderComposer::with_standard_library());
        cache.resolve(&mut backend, "flat", &MacroSet::new()).unwrap();
        assert_eq!(backend.live_programs(), 1);
        cache.clear(&mut backend);
        assert!(cache.is_empty());
        assert_eq!(backend.live_programs(), 0);
    }
}
