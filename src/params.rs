//! Parameter trees
//!
//! Models materialize their weights as a [`ParamTree`]: a type-tagged
//! recursive structure of named nodes, indexed sequences and tensor leaves.
//! Checkpointing and optimizer wiring both work on the flattened form, a map
//! from dotted names (`decoder.layers.1.lora_a`) to [`Var`]s.

use candle_core::Var;
use std::collections::BTreeMap;

/// Flat name -> variable mapping, ordered by name
pub type FlatParams = BTreeMap<String, Var>;

/// Possibly nested collection of model parameters
#[derive(Debug, Clone)]
pub enum ParamTree {
    /// A trainable tensor
    Leaf(Var),

    /// Named children
    Node(BTreeMap<String, ParamTree>),

    /// Indexed children (layer stacks, per-codebook heads)
    Seq(Vec<ParamTree>),

    /// A non-tensor entry; the tag describes what it is
    Other(String),
}

impl ParamTree {
    /// Build a node from `(name, subtree)` pairs
    pub fn node<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ParamTree)>,
        K: Into<String>,
    {
        ParamTree::Node(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a sequence of leaves
    pub fn seq_of_vars<'a>(vars: impl IntoIterator<Item = &'a Var>) -> Self {
        ParamTree::Seq(vars.into_iter().map(|v| ParamTree::Leaf(v.clone())).collect())
    }

    /// Wrap an already flattened mapping; flattening it again yields the same names
    pub fn from_flat(params: &FlatParams) -> Self {
        ParamTree::Node(
            params
                .iter()
                .map(|(name, var)| (name.clone(), ParamTree::Leaf(var.clone())))
                .collect(),
        )
    }

    /// Depth-first flatten into dotted names. `Other` entries are skipped.
    pub fn flatten(&self) -> FlatParams {
        let mut flat = FlatParams::new();
        flatten_into(self, "", &mut flat);
        flat
    }

    /// Number of tensor leaves in the tree
    pub fn num_tensors(&self) -> usize {
        match self {
            ParamTree::Leaf(_) => 1,
            ParamTree::Node(children) => children.values().map(ParamTree::num_tensors).sum(),
            ParamTree::Seq(items) => items.iter().map(ParamTree::num_tensors).sum(),
            ParamTree::Other(_) => 0,
        }
    }

    /// Total number of scalar elements across all leaves
    pub fn num_elements(&self) -> usize {
        self.flatten().values().map(|v| v.elem_count()).sum()
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn flatten_into(tree: &ParamTree, prefix: &str, flat: &mut FlatParams) {
    match tree {
        ParamTree::Leaf(var) => {
            flat.insert(prefix.to_string(), var.clone());
        }
        ParamTree::Node(children) => {
            for (name, child) in children {
                flatten_into(child, &join(prefix, name), flat);
            }
        }
        ParamTree::Seq(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(item, &join(prefix, &i.to_string()), flat);
            }
        }
        ParamTree::Other(kind) => {
            tracing::warn!("Skipping parameter {} of type {}", prefix, kind);
        }
    }
}
