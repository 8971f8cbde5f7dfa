//! Fragment source assembly.
//!
//! A layer's fragment text is authored against a small set of implicit
//! globals (`gUV`, `gPosition`, `gFragColor`, `gPreviousLayer`, `gResolution`,
//! `gTime`). [`assemble`] produces the final source an author would recognise;
//! [`lower`] rewrites it into Vulkan-flavoured GLSL that naga accepts: loose
//! `int`/`float` uniforms move into the `LayerParams` block, each
//! `sampler2D` becomes a texture/sampler pair on its own unit, and any other
//! loose non-opaque uniform becomes a plain global that always reads zero.

use super::reflect::{scan_uniform_lines, UniformKind};
use std::collections::HashMap;
use std::fmt::Write;

/// Name of the std140 block holding resolution and time.
pub const GLOBALS_BLOCK: &str = "GlobalUniforms";
/// Name of the std140 block holding a layer's scalar uniforms.
pub const PARAMS_BLOCK: &str = "LayerParams";

pub const RESOLUTION_UNIFORM: &str = "gResolution";
pub const TIME_UNIFORM: &str = "gTime";
pub const PREVIOUS_LAYER_UNIFORM: &str = "gPreviousLayer";

/// Header declaring the implicit globals, as authors see it.
pub const HEADER: &str = "\
#version 450
in vec2 gPosition;
in vec2 gUV;
out vec4 gFragColor;
uniform sampler2D gPreviousLayer;
uniform vec2 gResolution;
uniform float gTime;
";

/// Footer added when the fragment only defines `render()`.
pub const FOOTER: &str = "
void main() {
    gFragColor = render();
}
";

const VULKAN_PRELUDE: &str = "\
#version 450
layout(location = 0) in vec2 gPosition;
layout(location = 1) in vec2 gUV;
layout(location = 0) out vec4 gFragColor;

layout(std140, set = 0, binding = 0) uniform GlobalUniforms {
    vec2 gResolution;
    float gTime;
};

layout(set = 1, binding = 0) uniform texture2D gPreviousLayer_tex;
layout(set = 1, binding = 1) uniform sampler gPreviousLayer_smp;
#define gPreviousLayer sampler2D(gPreviousLayer_tex, gPreviousLayer_smp)
";

/// Name of the texture global backing a sampler uniform.
pub fn texture_global(name: &str) -> String {
    format!("{name}_tex")
}

/// Name of the sampler global backing a sampler uniform.
pub fn sampler_global(name: &str) -> String {
    format!("{name}_smp")
}

/// Whether the fragment text defines its own `main`.
pub fn defines_main(fragment: &str) -> bool {
    fragment.lines().any(|line| {
        line.trim_start()
            .strip_prefix("void")
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .map(|rest| rest.trim_start())
            .and_then(|rest| rest.strip_prefix("main"))
            .is_some_and(|rest| rest.trim_start().starts_with('('))
    })
}

fn footer_for(fragment: &str) -> &'static str {
    if defines_main(fragment) {
        ""
    } else {
        FOOTER
    }
}

/// The final source text of a layer: header, fragment body, footer.
pub fn assemble(fragment: &str) -> String {
    format!("{HEADER}{}\n{}", strip_version(fragment), footer_for(fragment))
}

/// Drops a leading `#version` directive; the header provides one.
fn strip_version(fragment: &str) -> String {
    let mut skipped = false;
    fragment
        .lines()
        .map(|line| {
            if !skipped && line.trim_start().starts_with("#version") {
                skipped = true;
                ""
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// GLSL ready for naga, plus the sampler units it declares.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredSource {
    pub glsl: String,
    /// Authored sampler uniforms and their units, in declaration order.
    pub samplers: Vec<(String, u32)>,
    /// Whether a `LayerParams` block was emitted.
    pub has_params: bool,
    /// Lines emitted ahead of the authored text. Diagnostics subtract this
    /// to point at the author's own line numbers.
    pub prelude_lines: usize,
}

impl LoweredSource {
    /// Units in use including unit 0 (the previous layer).
    pub fn texture_units(&self) -> u32 {
        self.samplers.len() as u32 + 1
    }
}

/// Rewrites a fragment into GLSL naga can compile against the engine's
/// bind group layout. Declaration lines are blanked rather than removed so
/// authored line numbers survive behind a fixed prelude.
pub fn lower(fragment: &str) -> LoweredSource {
    let body = strip_version(fragment);
    let declarations = scan_uniform_lines(&body);

    let mut prelude = String::from(VULKAN_PRELUDE);
    let scalars: Vec<_> = declarations
        .iter()
        .filter(|d| d.kind().is_some_and(UniformKind::is_numeric))
        .collect();
    let has_params = !scalars.is_empty();
    if has_params {
        let _ = writeln!(prelude, "\nlayout(std140, set = 0, binding = 1) uniform {PARAMS_BLOCK} {{");
        for declaration in &scalars {
            let _ = writeln!(prelude, "    {}", declaration.declaration);
        }
        prelude.push_str("};\n");
    }

    let mut samplers = Vec::new();
    for declaration in declarations.iter().filter(|d| d.kind() == Some(UniformKind::Sampler2D)) {
        let unit = samplers.len() as u32 + 1;
        let name = &declaration.name;
        let texture = texture_global(name);
        let sampler = sampler_global(name);
        let _ = writeln!(
            prelude,
            "\nlayout(set = 1, binding = {}) uniform texture2D {texture};\n\
             layout(set = 1, binding = {}) uniform sampler {sampler};\n\
             #define {name} sampler2D({texture}, {sampler})",
            unit * 2,
            unit * 2 + 1,
        );
        samplers.push((name.clone(), unit));
    }

    // Reflected declarations are blanked; other non-opaque uniforms are
    // rewritten in place as private globals.
    let replacements: HashMap<usize, &str> = declarations
        .iter()
        .filter_map(|d| match d.kind() {
            Some(_) => Some((d.line, "")),
            None if !d.is_opaque() => Some((d.line, d.declaration.as_str())),
            None => None,
        })
        .collect();
    let prelude_lines = prelude.lines().count();
    let mut glsl = prelude;
    for (index, line) in body.lines().enumerate() {
        glsl.push_str(replacements.get(&index).copied().unwrap_or(line));
        glsl.push('\n');
    }
    glsl.push_str(footer_for(fragment));

    LoweredSource {
        glsl,
        samplers,
        has_params,
        prelude_lines,
    }
}
