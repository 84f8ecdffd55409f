//! Typed shader macros.
//!
//! Engine-defined permutation axes are enum variants; user-authored macros
//! fall back to [`ShaderMacro::Custom`]. A [`MacroSet`] is ordered by key, so
//! two sets with the same content iterate (and hash) identically no matter
//! the order they were filled in.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A compile-time switch injected as `#define`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderMacro {
    UseDiffuse,
    UseSpecular,
    UseAttenuation,
    LightOmni,
    LightSpot,
    LightDirectional,
    UseShadowMap,
    ShadowCube,
    HardShadows,
    UseProjectiveTexture,
    ColorTexture,
    AlphaTest,
    UseClippingPlane,
    LowQuality,
    Custom(String),
}

impl ShaderMacro {
    const NAMED: [(ShaderMacro, &'static str); 14] = [
        (ShaderMacro::UseDiffuse, "USE_DIFFUSE"),
        (ShaderMacro::UseSpecular, "USE_SPECULAR"),
        (ShaderMacro::UseAttenuation, "USE_ATTENUATION"),
        (ShaderMacro::LightOmni, "LIGHT_OMNI"),
        (ShaderMacro::LightSpot, "LIGHT_SPOT"),
        (ShaderMacro::LightDirectional, "LIGHT_DIRECTIONAL"),
        (ShaderMacro::UseShadowMap, "USE_SHADOW_MAP"),
        (ShaderMacro::ShadowCube, "SHADOW_CUBE"),
        (ShaderMacro::HardShadows, "HARD_SHADOWS"),
        (ShaderMacro::UseProjectiveTexture, "USE_PROJECTIVE_TEXTURE"),
        (ShaderMacro::ColorTexture, "COLOR_TEXTURE"),
        (ShaderMacro::AlphaTest, "ALPHA_TEST"),
        (ShaderMacro::UseClippingPlane, "USE_CLIPPING_PLANE"),
        (ShaderMacro::LowQuality, "LOW_QUALITY"),
    ];

    /// The identifier written into the `#define`.
    pub fn name(&self) -> &str {
        match self {
            ShaderMacro::Custom(name) => name,
            typed => Self::NAMED
                .iter()
                .find(|(m, _)| m == typed)
                .map(|(_, name)| *name)
                .unwrap_or_default(),
        }
    }

    /// Parse a macro name, preferring the typed variant when one exists.
    pub fn from_name(name: &str) -> Self {
        Self::NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(m, _)| m.clone())
            .unwrap_or_else(|| ShaderMacro::Custom(name.to_string()))
    }
}

impl fmt::Display for ShaderMacro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for ShaderMacro {
    fn from(name: &str) -> Self {
        ShaderMacro::from_name(name)
    }
}

/// Value of a macro: a bare flag or a substituted value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MacroValue {
    Flag,
    Int(i64),
    Text(String),
}

impl MacroValue {
    /// Body of the `#define` line.
    pub fn define_body(&self) -> String {
        match self {
            MacroValue::Flag => String::new(),
            MacroValue::Int(v) => v.to_string(),
            MacroValue::Text(s) => s.clone(),
        }
    }
}

/// Ordered macro name to value map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroSet {
    entries: BTreeMap<ShaderMacro, MacroValue>,
}

impl MacroSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, name: impl Into<ShaderMacro>) -> Self {
        self.set_flag(name);
        self
    }

    pub fn with(mut self, name: impl Into<ShaderMacro>, value: MacroValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn set_flag(&mut self, name: impl Into<ShaderMacro>) {
        self.entries.insert(name.into(), MacroValue::Flag);
    }

    pub fn insert(&mut self, name: impl Into<ShaderMacro>, value: MacroValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &ShaderMacro) -> Option<MacroValue> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &ShaderMacro) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &ShaderMacro) -> Option<&MacroValue> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShaderMacro, &MacroValue)> {
        self.entries.iter()
    }

    /// Drop every entry, keeping the allocation-free map ready for reuse.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copy every entry of `other` over this set; `other` wins on collision.
    pub fn merge_from(&mut self, other: &MacroSet) {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
    }

    /// `#define` lines for every entry, in key order.
    pub fn to_defines(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            let body = value.define_body();
            if body.is_empty() {
                out.push_str(&format!("#define {}\n", name.name()));
            } else {
                out.push_str(&format!("#define {} {}\n", name.name(), body));
            }
        }
        out
    }

    /// Feed the set into a hasher by macro name, so a typed macro and a
    /// custom macro spelling the same identifier hash alike.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.entries.len().hash(state);
        for (name, value) in &self.entries {
            name.name().hash(state);
            value.hash(state);
        }
    }
}

impl fmt::Display for MacroSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match value {
                MacroValue::Flag => write!(f, "{}", name)?,
                other => write!(f, "{}={}", name, other.define_body())?,
            }
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_parse_to_typed_variants() {
        assert_eq!(ShaderMacro::from_name("USE_DIFFUSE"), ShaderMacro::UseDiffuse);
        assert_eq!(
            ShaderMacro::from_name("MY_EFFECT"),
            ShaderMacro::Custom("MY_EFFECT".into())
        );
        assert_eq!(ShaderMacro::ShadowCube.name(), "SHADOW_CUBE");
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = MacroSet::new();
        a.set_flag(ShaderMacro::UseSpecular);
        a.insert("QUALITY", MacroValue::Int(2));
        a.set_flag(ShaderMacro::LightOmni);

        let mut b = MacroSet::new();
        b.set_flag(ShaderMacro::LightOmni);
        b.set_flag(ShaderMacro::UseSpecular);
        b.insert("QUALITY", MacroValue::Int(2));

        assert_eq!(a, b);
        assert_eq!(a.to_defines(), b.to_defines());
    }

    #[test]
    fn defines_carry_values() {
        let set = MacroSet::new()
            .with_flag(ShaderMacro::AlphaTest)
            .with("SAMPLES", MacroValue::Int(4));
        let defines = set.to_defines();
        assert!(defines.contains("#define ALPHA_TEST\n"));
        assert!(defines.contains("#define SAMPLES 4\n"));
    }

    #[test]
    fn display_lists_entries() {
        let set = MacroSet::new()
            .with_flag(ShaderMacro::UseDiffuse)
            .with_flag(ShaderMacro::LightSpot);
        assert_eq!(set.to_string(), "[USE_DIFFUSE,LIGHT_SPOT]");
    }
}
