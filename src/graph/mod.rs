//! Join Graph: the rooted tree formed by `referenced_by` links
//!
//! Joins are processed in declaration order. A join either hangs from the
//! master table or from a join declared before it, so the tree is built in a
//! single forward pass and the synthesizers can emit `LEFT JOIN`s linearly.
//!
//! ```text
//! animal (master)
//! ├── cat        is_type
//! ├── dog        is_type
//! │   └── sheepdog  is_type (explicit)
//! └── passport   extension (is_type: false)
//! ```

use crate::definition::Definition;
use crate::error::{MergeViewError, MergeViewResult};

/// What a join is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Master,
    /// Index of the ancestor join in declaration order
    Join(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    anchors: Vec<Anchor>,
    is_type: Vec<bool>,
    depth: Vec<usize>,
    master_children: Vec<usize>,
    children: Vec<Vec<usize>>,
}

impl Topology {
    /// Build the adjacency structure, rejecting forward and unknown references
    pub fn build(definition: &Definition) -> MergeViewResult<Self> {
        let master_alias = definition.alias();
        let count = definition.joins.len();

        let mut topology = Topology {
            anchors: Vec::with_capacity(count),
            is_type: Vec::with_capacity(count),
            depth: Vec::with_capacity(count),
            master_children: Vec::new(),
            children: vec![Vec::new(); count],
        };

        for (index, (alias, join)) in definition.joins.iter().enumerate() {
            let anchor = match join.referenced_by.as_deref() {
                None => Anchor::Master,
                Some(parent) if parent == master_alias => Anchor::Master,
                Some(parent) => {
                    let position = definition.joins.iter().position(|(a, _)| a == parent);
                    match position {
                        Some(p) if p < index => Anchor::Join(p),
                        Some(_) => {
                            return Err(MergeViewError::ReferencedTableDefinedBeforeReferencing {
                                alias: alias.clone(),
                                referenced_by: parent.to_string(),
                            })
                        }
                        None => {
                            return Err(MergeViewError::invalid(format!(
                                "join {alias} is referenced by \"{parent}\" which is neither \
                                 a declared join nor the master alias \"{master_alias}\""
                            )))
                        }
                    }
                }
            };

            let depth = match anchor {
                Anchor::Master => {
                    topology.master_children.push(index);
                    1
                }
                Anchor::Join(parent) => {
                    topology.children[parent].push(index);
                    topology.depth[parent] + 1
                }
            };
            let is_type = definition.join_is_type(join);

            topology.anchors.push(anchor);
            topology.is_type.push(is_type);
            topology.depth.push(depth);
        }

        Ok(topology)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn anchor(&self, join: usize) -> Anchor {
        self.anchors[join]
    }

    /// Whether the join takes part in the discriminator
    pub fn is_type(&self, join: usize) -> bool {
        self.is_type[join]
    }

    /// 1 for direct children of the master
    pub fn depth(&self, join: usize) -> usize {
        self.depth[join]
    }

    pub fn children(&self, anchor: Anchor) -> &[usize] {
        match anchor {
            Anchor::Master => &self.master_children,
            Anchor::Join(j) => &self.children[j],
        }
    }

    /// Join ancestors of `join`, nearest first
    pub fn ancestors(&self, join: usize) -> Vec<usize> {
        let mut ancestors = Vec::new();
        let mut current = self.anchors[join];
        while let Anchor::Join(parent) = current {
            ancestors.push(parent);
            current = self.anchors[parent];
        }
        ancestors
    }

    /// Extension tables hanging from `anchor` through non-type links only
    pub fn extensions(&self, anchor: Anchor) -> Vec<usize> {
        let mut found = Vec::new();
        let mut stack: Vec<usize> = self.children(anchor).to_vec();
        while let Some(join) = stack.pop() {
            if !self.is_type[join] {
                found.push(join);
                stack.extend_from_slice(&self.children[join]);
            }
        }
        found.sort_unstable();
        found
    }

    /// Joins written for every row whatever its type, in declaration order
    pub fn unconditional(&self) -> Vec<usize> {
        self.extensions(Anchor::Master)
    }

    /// Joins participating in the discriminator, in declaration order
    pub fn types(&self) -> Vec<usize> {
        (0..self.len()).filter(|&j| self.is_type[j]).collect()
    }

    /// Types ordered deepest first, so that a nested type wins over its ancestor
    pub fn discriminator_order(&self) -> Vec<usize> {
        let mut types = self.types();
        types.sort_by(|a, b| self.depth[*b].cmp(&self.depth[*a]));
        types
    }

    /// Joins holding a row for every view row of type `join`, top-down.
    ///
    /// That is the type itself, its ancestors and the extensions of each,
    /// minus the unconditional joins that are written separately.
    pub fn footprint(&self, join: usize) -> Vec<usize> {
        let unconditional = self.unconditional();
        let mut members: Vec<usize> = self.ancestors(join);
        members.push(join);

        let mut extended = members.clone();
        for member in &members {
            extended.extend(self.extensions(Anchor::Join(*member)));
        }

        extended.retain(|j| !unconditional.contains(j));
        extended.sort_unstable();
        extended.dedup();
        extended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn zoo() -> Definition {
        Definition::from_value(json!({
            "table": "zoo.animal",
            "joins": {
                "cat": {"table": "zoo.cat"},
                "dog": {"table": "zoo.dog"},
                "sheepdog": {"table": "zoo.sheepdog", "referenced_by": "dog", "is_type": true},
                "collar": {"table": "zoo.collar", "referenced_by": "dog"},
                "passport": {"table": "zoo.passport", "is_type": false},
                "stamp": {"table": "zoo.stamp", "referenced_by": "passport"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_anchors_and_defaults() {
        let topology = Topology::build(&zoo()).unwrap();
        assert_eq!(topology.anchor(0), Anchor::Master);
        assert_eq!(topology.anchor(2), Anchor::Join(1));
        assert!(topology.is_type(0));
        assert!(topology.is_type(2));
        assert!(!topology.is_type(3));
        assert!(!topology.is_type(4));
        assert_eq!(topology.depth(2), 2);
        assert_eq!(topology.children(Anchor::Join(1)), &[2, 3]);
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let def = Definition::from_value(json!({
            "table": "zoo.animal",
            "joins": {
                "sheepdog": {"table": "zoo.sheepdog", "referenced_by": "dog"},
                "dog": {"table": "zoo.dog"}
            }
        }))
        .unwrap();
        let err = Topology::build(&def).unwrap_err();
        assert_eq!(err.to_string(), "\"sheepdog\" should be defined after \"dog\"");
    }

    #[test]
    fn test_self_reference_is_a_forward_reference() {
        let def = Definition::from_value(json!({
            "table": "zoo.animal",
            "joins": {"dog": {"table": "zoo.dog", "referenced_by": "dog"}}
        }))
        .unwrap();
        assert!(matches!(
            Topology::build(&def),
            Err(MergeViewError::ReferencedTableDefinedBeforeReferencing { .. })
        ));
    }

    #[test]
    fn test_unknown_reference() {
        let def = Definition::from_value(json!({
            "table": "zoo.animal",
            "joins": {"dog": {"table": "zoo.dog", "referenced_by": "wolf"}}
        }))
        .unwrap();
        let err = Topology::build(&def).unwrap_err();
        assert_eq!(err.sqlstate(), "42P17");
    }

    #[test]
    fn test_master_alias_as_reference() {
        let def = Definition::from_value(json!({
            "table": "zoo.animal",
            "joins": {"dog": {"table": "zoo.dog", "referenced_by": "animal"}}
        }))
        .unwrap();
        let topology = Topology::build(&def).unwrap();
        assert_eq!(topology.anchor(0), Anchor::Master);
        assert!(topology.is_type(0));
    }

    #[test]
    fn test_discriminator_order_is_deepest_first() {
        let topology = Topology::build(&zoo()).unwrap();
        assert_eq!(topology.types(), vec![0, 1, 2]);
        assert_eq!(topology.discriminator_order(), vec![2, 0, 1]);
    }

    #[test]
    fn test_unconditional_joins() {
        let topology = Topology::build(&zoo()).unwrap();
        assert_eq!(topology.unconditional(), vec![4, 5]);
    }

    #[test]
    fn test_footprints() {
        let topology = Topology::build(&zoo()).unwrap();
        assert_eq!(topology.footprint(0), vec![0]);
        assert_eq!(topology.footprint(1), vec![1, 3]);
        assert_eq!(topology.footprint(2), vec![1, 2, 3]);
        assert_eq!(topology.ancestors(2), vec![1]);
    }
}
