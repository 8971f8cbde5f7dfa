//! Uniform reflection: typed, bounded parameters derived from shader text.
//!
//! Scanning is a line tokenizer over the fixed grammar
//! `uniform [precision] <type> <identifier> ... ; // <hints>`. It does not
//! try to understand GLSL beyond that. Only `int`, `float` and `sampler2D`
//! are reflected; other types are still found so lowering can rewrite them.
//! Location resolution is a separate step against a linked program, so
//! declarations the compiler dropped as unused are skipped rather than
//! reported.

use super::metadata::{coerce_float, coerce_int, coerce_number, coerce_texture, TextureSource, UniformHints};
use crate::texture::TextureHandle;
use std::fmt;
use std::sync::OnceLock;

/// The uniform kinds the engine reflects itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Int,
    Float,
    Sampler2D,
}

impl UniformKind {
    /// Maps a GLSL type token to a reflected kind.
    pub fn from_glsl(token: &str) -> Option<Self> {
        match token {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "sampler2D" => Some(Self::Sampler2D),
            _ => None,
        }
    }

    pub fn glsl_name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Sampler2D => "sampler2D",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

impl fmt::Display for UniformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.glsl_name())
    }
}

/// Scalar type of a uniform block member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int,
    Float,
}

/// Where a reflected uniform lives in a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformLocation {
    /// Byte offset of a member of the layer's parameter block.
    Scalar { offset: u32, ty: ScalarType },
    /// Texture unit; unit `u` occupies texture bindings `2u` and `2u + 1`.
    Texture { unit: u32 },
}

/// A coerced uniform value ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Texture(TextureSource),
}

impl UniformValue {
    /// Coerces a raw authored value according to `kind`.
    pub fn coerce(kind: UniformKind, raw: Option<&serde_yaml::Value>) -> Self {
        match kind {
            UniformKind::Int => Self::Int(coerce_int(raw)),
            UniformKind::Float => Self::Float(coerce_float(raw)),
            UniformKind::Sampler2D => Self::Texture(coerce_texture(raw)),
        }
    }
}

/// Type prefixes of GLSL opaque types, which need a binding of their own.
const OPAQUE_PREFIXES: [&str; 9] = [
    "sampler", "isampler", "usampler", "texture", "itexture", "utexture", "image", "iimage", "uimage",
];

const PRECISION_QUALIFIERS: [&str; 3] = ["lowp", "mediump", "highp"];

/// Any loose `uniform` declaration line, whatever its type.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformLine {
    /// GLSL type token, without a precision qualifier.
    pub ty: String,
    pub name: String,
    pub hints: UniformHints,
    /// Zero-based line index within the scanned text.
    pub line: usize,
    /// `<type> <name>...;` without the `uniform` keyword, precision or comment.
    pub declaration: String,
}

impl UniformLine {
    /// The reflected kind, if the engine reflects this type.
    pub fn kind(&self) -> Option<UniformKind> {
        UniformKind::from_glsl(&self.ty)
    }

    pub fn is_opaque(&self) -> bool {
        OPAQUE_PREFIXES.iter().any(|prefix| self.ty.starts_with(prefix))
    }
}

/// A `uniform` declaration found in source text, before location resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformDeclaration {
    pub name: String,
    pub kind: UniformKind,
    pub hints: UniformHints,
    /// Zero-based line index within the scanned text.
    pub line: usize,
    /// The declaration itself without the `uniform` keyword or comment,
    /// e.g. `float amount;`.
    pub declaration: String,
}

/// Resolves uniform names to locations in a linked program.
pub trait LocationResolver {
    /// Returns `None` when the program has no active uniform of that name.
    fn uniform_location(&self, name: &str) -> Option<UniformLocation>;
}

/// A reflected, validated uniform of one compiled layer.
#[derive(Debug)]
pub struct UniformDescriptor {
    pub name: String,
    pub location: UniformLocation,
    pub kind: UniformKind,
    pub default: UniformValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    texture: OnceLock<TextureHandle>,
}

impl UniformDescriptor {
    pub fn new(declaration: &UniformDeclaration, location: UniformLocation) -> Self {
        let kind = declaration.kind;
        let bound = |raw: &Option<serde_yaml::Value>| match (kind, raw) {
            (UniformKind::Int, Some(_)) => Some(coerce_number(raw.as_ref()).floor()),
            (UniformKind::Float, Some(_)) => Some(coerce_number(raw.as_ref())),
            _ => None,
        };
        Self {
            name: declaration.name.clone(),
            location,
            kind,
            default: UniformValue::coerce(kind, declaration.hints.default.as_ref()),
            min: bound(&declaration.hints.min),
            max: bound(&declaration.hints.max),
            texture: OnceLock::new(),
        }
    }

    /// Coerces an authored value, falling back to the default when absent.
    /// Numeric values are clamped into `[min, max]` where bounds are given.
    pub fn resolve(&self, raw: Option<&serde_yaml::Value>) -> UniformValue {
        let value = match raw {
            Some(raw) => UniformValue::coerce(self.kind, Some(raw)),
            None => self.default.clone(),
        };
        match value {
            UniformValue::Int(v) => UniformValue::Int(self.clamp(f64::from(v)) as i32),
            UniformValue::Float(v) => UniformValue::Float(self.clamp(f64::from(v)) as f32),
            texture => texture,
        }
    }

    fn clamp(&self, mut value: f64) -> f64 {
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }

    /// The cached texture, if one was created.
    pub fn cached_texture(&self) -> Option<&TextureHandle> {
        self.texture.get()
    }

    /// Returns the cached texture, creating it with `init` on first use.
    /// `init` runs at most once per descriptor.
    pub fn texture_or_init(&self, init: impl FnOnce() -> TextureHandle) -> &TextureHandle {
        self.texture.get_or_init(init)
    }
}

/// Splits a leading identifier off `text`.
fn split_identifier(text: &str) -> (&str, &str) {
    let end = text
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && c.is_ascii_digit()))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(end)
}

/// Splits the next whitespace-terminated token off `text`.
fn split_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    Some(text.split_at(text.find(char::is_whitespace)?))
}

/// Parses one line as a loose uniform declaration of any type.
fn parse_uniform_line(line: &str, index: usize) -> Option<UniformLine> {
    let rest = line.trim_start().strip_prefix("uniform")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let (mut ty, mut rest) = split_token(rest)?;
    if PRECISION_QUALIFIERS.contains(&ty) {
        (ty, rest) = split_token(rest)?;
    }

    let rest = rest.trim_start();
    let (name, tail) = split_identifier(rest);
    if name.is_empty() {
        return None;
    }

    let semicolon = tail.find(';')?;
    let (body, after) = tail.split_at(semicolon);
    if body.contains("//") {
        return None;
    }
    let after = &after[1..];
    let hints = after
        .find("//")
        .map(|start| UniformHints::parse(&after[start + 2..]))
        .unwrap_or_default();

    Some(UniformLine {
        ty: ty.to_string(),
        name: name.to_string(),
        hints,
        line: index,
        declaration: format!("{ty} {name}{body};"),
    })
}

/// Finds every loose `uniform` declaration in `source`, in order.
pub fn scan_uniform_lines(source: &str) -> Vec<UniformLine> {
    source
        .lines()
        .enumerate()
        .filter_map(|(index, line)| parse_uniform_line(line, index))
        .collect()
}

/// Finds every supported `uniform` declaration in `source`, in order.
pub fn scan_declarations(source: &str) -> Vec<UniformDeclaration> {
    scan_uniform_lines(source)
        .into_iter()
        .filter_map(|line| {
            Some(UniformDeclaration {
                kind: line.kind()?,
                name: line.name,
                hints: line.hints,
                line: line.line,
                declaration: line.declaration,
            })
        })
        .collect()
}

/// Reflects the uniforms of a linked program from its source text.
///
/// Declarations without an active location are skipped silently.
pub fn reflect_uniforms(source: &str, program: &impl LocationResolver) -> Vec<UniformDescriptor> {
    scan_declarations(source)
        .iter()
        .filter_map(|declaration| {
            let location = program.uniform_location(&declaration.name)?;
            Some(UniformDescriptor::new(declaration, location))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeProgram(HashMap<&'static str, UniformLocation>);

    impl LocationResolver for FakeProgram {
        fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
            self.0.get(name).copied()
        }
    }

    fn float_at(offset: u32) -> UniformLocation {
        UniformLocation::Scalar { offset, ty: ScalarType::Float }
    }

    #[test]
    fn test_scan_supported_kinds() {
        let source = "\
uniform float amount; // default: 0.5, min: 0, max: 1
uniform int steps;
uniform sampler2D noise; // default: \"noise.png\"
uniform vec3 tint; // default: 1
  uniform   float   spaced ;
vec4 render() { return vec4(amount); }
";
        let found = scan_declarations(source);
        let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["amount", "steps", "noise", "spaced"]);
        assert_eq!(found[0].kind, UniformKind::Float);
        assert_eq!(found[1].kind, UniformKind::Int);
        assert_eq!(found[2].kind, UniformKind::Sampler2D);
        assert_eq!(found[0].declaration, "float amount;");
        assert_eq!(found[3].declaration, "float spaced ;");
        assert_eq!(found[3].line, 4);
    }

    #[test]
    fn test_no_declarations_reflect_to_nothing() {
        let source = "vec4 render() { return vec4(1.0); }\n// uniform float commented;\n";
        let program = FakeProgram(HashMap::from([("commented", float_at(0))]));
        assert!(reflect_uniforms(source, &program).is_empty());
    }

    #[test]
    fn test_inactive_uniforms_are_skipped() {
        let source = "uniform float used;\nuniform float unused;\n";
        let program = FakeProgram(HashMap::from([("used", float_at(0))]));
        let uniforms = reflect_uniforms(source, &program);
        assert_eq!(uniforms.len(), 1);
        assert_eq!(uniforms[0].name, "used");
    }

    #[test]
    fn test_absent_numeric_default_is_zero() {
        let source = "uniform int count; // min: 1\nuniform float gain; // max: 4\n";
        let program = FakeProgram(HashMap::from([
            ("count", UniformLocation::Scalar { offset: 0, ty: ScalarType::Int }),
            ("gain", float_at(4)),
        ]));
        let uniforms = reflect_uniforms(source, &program);
        assert_eq!(uniforms[0].default, UniformValue::Int(0));
        assert_eq!(uniforms[0].min, Some(1.0));
        assert_eq!(uniforms[0].max, None);
        assert_eq!(uniforms[1].default, UniformValue::Float(0.0));
        assert_eq!(uniforms[1].max, Some(4.0));
    }

    #[test]
    fn test_int_hints_are_floored() {
        let source = "uniform int level; // default: 2.7, min: 0.5, max: 9.9\n";
        let program = FakeProgram(HashMap::from([(
            "level",
            UniformLocation::Scalar { offset: 0, ty: ScalarType::Int },
        )]));
        let level = &reflect_uniforms(source, &program)[0];
        assert_eq!(level.default, UniformValue::Int(2));
        assert_eq!(level.min, Some(0.0));
        assert_eq!(level.max, Some(9.0));
    }

    #[test]
    fn test_sampler_defaults() {
        let source = "\
uniform sampler2D bare; // default: 7
uniform sampler2D missing;
uniform sampler2D record; // default: {url: \"grid.png\"}
uniform sampler2D broken; // default: [
";
        let program = FakeProgram(HashMap::from([
            ("bare", UniformLocation::Texture { unit: 1 }),
            ("missing", UniformLocation::Texture { unit: 2 }),
            ("record", UniformLocation::Texture { unit: 3 }),
            ("broken", UniformLocation::Texture { unit: 4 }),
        ]));
        let uniforms = reflect_uniforms(source, &program);
        let urls: Vec<_> = uniforms
            .iter()
            .map(|u| match &u.default {
                UniformValue::Texture(source) => source.url.as_str(),
                other => panic!("unexpected default {other:?}"),
            })
            .collect();
        assert_eq!(urls, ["7", "", "grid.png", ""]);
    }

    #[test]
    fn test_resolve_uses_default_and_clamps() {
        let source = "uniform float mix; // default: 0.25, min: 0, max: 1\n";
        let program = FakeProgram(HashMap::from([("mix", float_at(0))]));
        let mix = &reflect_uniforms(source, &program)[0];
        assert_eq!(mix.resolve(None), UniformValue::Float(0.25));
        assert_eq!(mix.resolve(Some(&serde_yaml::Value::from(3.0))), UniformValue::Float(1.0));
        assert_eq!(mix.resolve(Some(&serde_yaml::Value::from(-2))), UniformValue::Float(0.0));
        assert_eq!(mix.resolve(Some(&serde_yaml::Value::from("0.5"))), UniformValue::Float(0.5));
    }

    #[test]
    fn test_precision_qualifiers_are_skipped() {
        let source = "uniform highp float amount; // default: 0.5\nuniform mediump sampler2D noise;\n";
        let found = scan_declarations(source);
        let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["amount", "noise"]);
        assert_eq!(found[0].declaration, "float amount;");
        assert_eq!(found[0].hints.default, Some(serde_yaml::Value::from(0.5)));

        let program = FakeProgram(HashMap::from([("amount", float_at(0))]));
        let amount = &reflect_uniforms(source, &program)[0];
        assert_eq!(amount.resolve(None), UniformValue::Float(0.5));
    }

    #[test]
    fn test_uniform_lines_include_unreflected_types() {
        let source = "\
uniform vec3 tint; // default: 1
uniform lowp vec2 offset;
uniform bool enabled;
uniform samplerCube sky;
uniform float amount;
";
        let lines = scan_uniform_lines(source);
        let types: Vec<_> = lines.iter().map(|l| (l.ty.as_str(), l.kind(), l.is_opaque())).collect();
        assert_eq!(
            types,
            [
                ("vec3", None, false),
                ("vec2", None, false),
                ("bool", None, false),
                ("samplerCube", None, true),
                ("float", Some(UniformKind::Float), false),
            ]
        );
        assert_eq!(lines[1].declaration, "vec2 offset;");
        assert_eq!(scan_declarations(source).len(), 1);
    }

    #[test]
    fn test_declarations_need_a_semicolon_and_known_kind() {
        assert!(scan_declarations("uniform float missing_semicolon\n").is_empty());
        assert!(scan_declarations("uniformfloat glued;\n").is_empty());
        assert!(scan_declarations("uniform mat4 model;\n").is_empty());
        assert!(scan_declarations("uniform float 2bad;\n").is_empty());
    }
}
