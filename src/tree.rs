//! Layer trees: the authored composition and its compiled mirror.
//!
//! Both trees share one shape, [`Group<L>`], so the compiled tree is
//! isomorphic to the authored one by construction. Authored trees are usually
//! read from YAML with [`load_tree`].

use crate::error::TreeError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Raw authored uniform values, keyed by uniform name.
pub type UniformValues = BTreeMap<String, serde_yaml::Value>;

/// An ordered container of layers and nested groups.
///
/// Insertion order is composite order. The last child is drawn first.
#[derive(Debug, Clone, Deserialize)]
pub struct Group<L> {
    #[serde(default)]
    pub name: Option<String>,
    /// Accumulated time in seconds, owned by the caller's time step.
    #[serde(default)]
    pub time: f64,
    #[serde(default = "Vec::new")]
    pub children: Vec<Node<L>>,
}

/// One child of a [`Group`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Node<L> {
    Layer(L),
    Group(Group<L>),
}

impl<L> Default for Group<L> {
    fn default() -> Self {
        Self {
            name: None,
            time: 0.0,
            children: Vec::new(),
        }
    }
}

impl<L> Group<L> {
    pub fn new(children: Vec<Node<L>>) -> Self {
        Self {
            children,
            ..Self::default()
        }
    }

    /// Number of layers in the whole subtree.
    pub fn layer_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                Node::Layer(_) => 1,
                Node::Group(group) => group.layer_count(),
            })
            .sum()
    }

    /// Builds an isomorphic tree by transforming every layer in declared order.
    pub fn map_layers<M>(&self, f: &mut impl FnMut(&L) -> M) -> Group<M> {
        Group {
            name: self.name.clone(),
            time: self.time,
            children: self
                .children
                .iter()
                .map(|child| match child {
                    Node::Layer(layer) => Node::Layer(f(layer)),
                    Node::Group(group) => Node::Group(group.map_layers(f)),
                })
                .collect(),
        }
    }

    /// Fallible version of [`Group::map_layers`]; stops at the first error.
    pub fn try_map_layers<M, E>(
        &self,
        f: &mut impl FnMut(&L) -> Result<M, E>,
    ) -> Result<Group<M>, E> {
        let mut children = Vec::with_capacity(self.children.len());
        for child in &self.children {
            children.push(match child {
                Node::Layer(layer) => Node::Layer(f(layer)?),
                Node::Group(group) => Node::Group(group.try_map_layers(f)?),
            });
        }
        Ok(Group {
            name: self.name.clone(),
            time: self.time,
            children,
        })
    }

    /// Finds the first layer (declared order, depth first) matching `pred`.
    pub fn find_layer_mut(&mut self, pred: &impl Fn(&L) -> bool) -> Option<&mut L> {
        for child in &mut self.children {
            let found = match child {
                Node::Layer(layer) => pred(layer).then_some(layer),
                Node::Group(group) => group.find_layer_mut(pred),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

/// How a layer is blended by the external compositor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Normal,
    Add,
    Multiply,
    Screen,
}

/// How a layer's clock relates to the global clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeMode {
    #[default]
    Global,
    Local,
    Paused,
}

/// Layer metadata. Carried through compilation untouched; the renderer
/// itself never reads it.
#[derive(Debug, Clone, Deserialize)]
pub struct LayerMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub blend_mode: BlendMode,
    #[serde(default = "default_unit")]
    pub opacity: f32,
    #[serde(default)]
    pub time_mode: TimeMode,
    #[serde(default = "default_unit")]
    pub time_scale: f32,
}

fn default_visible() -> bool {
    true
}

fn default_unit() -> f32 {
    1.0
}

impl Default for LayerMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: None,
            visible: true,
            blend_mode: BlendMode::Normal,
            opacity: 1.0,
            time_mode: TimeMode::Global,
            time_scale: 1.0,
        }
    }
}

/// One authored shader layer: fragment source, raw uniform values and metadata.
#[derive(Debug, Clone, Default)]
pub struct ShaderLayer {
    pub source: String,
    pub values: UniformValues,
    pub meta: LayerMeta,
}

impl ShaderLayer {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            values: UniformValues::new(),
            meta: LayerMeta {
                name: name.into(),
                ..LayerMeta::default()
            },
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

pub type AuthoredNode = Node<ShaderLayer>;
pub type AuthoredGroup = Group<ShaderLayer>;

/// A layer as written in a tree file: inline `source` or a `path` to a
/// fragment file, resolved relative to the tree file.
#[derive(Debug, Clone, Deserialize)]
struct LayerEntry {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    values: UniformValues,
    #[serde(flatten)]
    meta: LayerMeta,
}

impl LayerEntry {
    fn resolve(&self, base_dir: &Path) -> Result<ShaderLayer, TreeError> {
        let source = match (&self.source, &self.path) {
            (Some(source), None) => source.clone(),
            (None, Some(path)) => {
                let path = base_dir.join(path);
                debug!(path = %path.display(), "reading layer source");
                fs::read_to_string(&path).map_err(|source| TreeError::Io { path, source })?
            }
            _ => return Err(TreeError::MissingSource(self.meta.name.clone())),
        };
        Ok(ShaderLayer {
            source,
            values: self.values.clone(),
            meta: self.meta.clone(),
        })
    }
}

/// Parses a tree document. Layer `path`s are resolved against `base_dir`.
pub fn parse_tree(text: &str, base_dir: &Path) -> Result<AuthoredGroup, TreeError> {
    let entries: Group<LayerEntry> = serde_yaml::from_str(text)?;
    entries.try_map_layers(&mut |entry| entry.resolve(base_dir))
}

/// Reads and parses a tree file.
pub fn load_tree(path: &Path) -> Result<AuthoredGroup, TreeError> {
    let text = fs::read_to_string(path).map_err(|source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tree = parse_tree(&text, base_dir)?;
    info!(path = %path.display(), layers = tree.layer_count(), "loaded layer tree");
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = r#"
name: root
children:
  - layer:
      name: Invert
      source: "vec4 render() { return vec4(1.0); }"
  - group:
      name: inner
      children:
        - layer:
            name: Grain
            id: grain
            opacity: 0.5
            blend_mode: add
            source: "vec4 render() { return vec4(0.0); }"
            values:
              amount: 0.25
"#;

    #[test]
    fn test_parse_nested_tree() {
        let tree = parse_tree(TREE, Path::new(".")).unwrap();
        assert_eq!(tree.name.as_deref(), Some("root"));
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.layer_count(), 2);

        let Node::Group(inner) = &tree.children[1] else {
            panic!("expected a group");
        };
        let Node::Layer(grain) = &inner.children[0] else {
            panic!("expected a layer");
        };
        assert_eq!(grain.meta.name, "Grain");
        assert_eq!(grain.meta.id.as_deref(), Some("grain"));
        assert_eq!(grain.meta.blend_mode, BlendMode::Add);
        assert_eq!(grain.meta.opacity, 0.5);
        assert!(grain.meta.visible);
        assert_eq!(grain.values["amount"].as_f64(), Some(0.25));
    }

    #[test]
    fn test_layer_needs_a_source() {
        let text = "children:\n  - layer:\n      name: Empty\n";
        let err = parse_tree(text, Path::new(".")).unwrap_err();
        assert!(matches!(err, TreeError::MissingSource(name) if name == "Empty"));
    }

    #[test]
    fn test_map_layers_preserves_shape() {
        let tree = parse_tree(TREE, Path::new(".")).unwrap();
        let names = tree.map_layers(&mut |layer| layer.meta.name.clone());
        let Node::Layer(first) = &names.children[0] else {
            panic!("expected a layer");
        };
        assert_eq!(first, "Invert");
        assert!(matches!(&names.children[1], Node::Group(g) if g.name.as_deref() == Some("inner")));
    }

    #[test]
    fn test_find_layer_mut_descends_into_groups() {
        let mut tree = parse_tree(TREE, Path::new(".")).unwrap();
        let layer = tree
            .find_layer_mut(&|layer| layer.meta.id.as_deref() == Some("grain"))
            .unwrap();
        layer.values.insert("amount".into(), 1.into());
        assert!(tree.find_layer_mut(&|layer| layer.meta.name == "Missing").is_none());
    }
}
