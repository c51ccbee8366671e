use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::context::TransitionContext;
use crate::error::{EngineError, EngineResult};
use crate::filter::Filter;
use crate::handler::{EnterHandler, ExitHandler, MessageHandler};
use crate::key::StateKey;
use crate::streams::EngineStreams;

/// What role a node plays in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Interior,
    Leaf,
    FinalLeaf,
}

impl NodeKind {
    pub fn is_composite(&self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Interior)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Leaf | NodeKind::FinalLeaf)
    }
}

/// Type-erased "publish this freshly-seeded or updated value to its
/// `dataStream`" callback, captured with the concrete `D` at the point a
/// [`DataSpec`] is declared so the transition engine can seed data states
/// without itself being generic over `D`.
type PublishFn = Arc<dyn Fn(&EngineStreams, &StateKey, &dyn Any, usize) + Send + Sync>;

/// Immutable, type-erased description of the value a data state carries.
pub struct DataSpec {
    pub(crate) type_name: &'static str,
    pub(crate) initial: InitialDataFn,
    pub(crate) codec: Option<Arc<dyn crate::data::ErasedCodec>>,
    pub(crate) publish: PublishFn,
    /// `true` for states declared through the data-typed key API with "no
    /// data" (`DataStateKey<()>`); their value is never closed on exit so
    /// reads of `()` never fail while the state is active (§9.3).
    pub(crate) is_void: bool,
}

impl DataSpec {
    /// Declares a data state carrying `D`, with an async producer for its
    /// initial value run at entry time (§4.7 step 4).
    pub fn typed<D, F, Fut>(initial: F) -> Self
    where
        D: Clone + Send + Sync + 'static,
        F: Fn(&TransitionContext<'_>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = D> + Send + 'static,
    {
        let initial: InitialDataFn = Arc::new(move |ctx| {
            let fut = initial(ctx);
            Box::pin(async move { Box::new(fut.await) as Box<dyn Any + Send> })
        });
        Self {
            type_name: std::any::type_name::<D>(),
            initial,
            codec: None,
            publish: Arc::new(|streams, key, value, capacity| {
                if let Some(v) = value.downcast_ref::<D>() {
                    streams.publish::<D>(key, v.clone(), capacity);
                }
            }),
            is_void: false,
        }
    }

    /// Attaches a codec so this data state's value can round-trip through
    /// `saveTo`/`loadFrom` (§4.11). Without one, the state is skipped on save
    /// and rejected if a snapshot tries to restore a value into it.
    pub fn with_codec<D, C>(mut self, codec: C) -> Self
    where
        D: Clone + Send + Sync + 'static,
        C: crate::data::DataCodec<D> + 'static,
    {
        self.codec = Some(Arc::new(crate::data::ErasedCodecImpl {
            codec,
            _marker: std::marker::PhantomData,
        }));
        self
    }

    /// A "no data" data state, always holding `()` (§9.3).
    pub fn void() -> Self {
        Self {
            type_name: "()",
            initial: Arc::new(|_ctx| Box::pin(async { Box::new(()) as Box<dyn Any + Send> })),
            codec: None,
            publish: Arc::new(|_streams, _key, _value, _capacity| {}),
            is_void: true,
        }
    }
}

pub type InitialDataFn =
    Arc<dyn Fn(&TransitionContext<'_>) -> futures::future::BoxFuture<'static, Box<dyn Any + Send>> + Send + Sync>;

pub type InitialChildFn = Arc<dyn Fn(&TransitionContext<'_>) -> StateKey + Send + Sync>;

/// An immutable node in the state tree. Built once at engine construction and
/// never mutated afterwards; ancestry is modeled with a weak parent pointer
/// so the tree has no reference cycles.
pub struct Node {
    pub key: StateKey,
    pub kind: NodeKind,
    pub(crate) parent: Option<Weak<Node>>,
    pub(crate) children: Vec<Arc<Node>>,
    pub(crate) initial_child: Option<InitialChildFn>,
    pub(crate) data: Option<DataSpec>,
    pub(crate) filters: Vec<Arc<dyn Filter>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub(crate) on_enter: Option<Arc<dyn EnterHandler>>,
    pub(crate) on_exit: Option<Arc<dyn ExitHandler>>,
    pub(crate) on_message: Option<Arc<dyn MessageHandler>>,
}

/// Reference-counted handle to a [`Node`]. Cheap to clone; comparisons are by
/// the node's [`StateKey`].
pub type TreeNode = Arc<Node>;

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Node {}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Node {
    pub fn parent(&self) -> Option<TreeNode> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> &[TreeNode] {
        &self.children
    }

    pub fn is_data_state(&self) -> bool {
        self.data.is_some()
    }

    /// Lazy iterator over this node and its ancestors, self first, root last.
    pub fn self_and_ancestors(self: &TreeNode) -> AncestorIter {
        AncestorIter {
            next: Some(self.clone()),
        }
    }

    /// Pre-order iterator over this node and its descendants.
    pub fn self_and_descendants(self: &TreeNode) -> DescendantIter {
        DescendantIter {
            stack: vec![self.clone()],
        }
    }

    /// `true` if `self` is `key` or an ancestor of it.
    pub fn is_self_or_ancestor_of(self: &TreeNode, other: &TreeNode) -> bool {
        other.self_and_ancestors().any(|n| n.key == self.key)
    }

    pub fn self_or_ancestor_with_key(self: &TreeNode, k: &StateKey) -> Option<TreeNode> {
        self.self_and_ancestors().find(|n| &n.key == k)
    }

    /// Least common ancestor of `self` and `other`. Never panics: invariant
    /// (I2) guarantees both chains terminate at the same root.
    pub fn lca_with(self: &TreeNode, other: &TreeNode) -> TreeNode {
        let mut a: Vec<TreeNode> = self.self_and_ancestors().collect();
        let mut b: Vec<TreeNode> = other.self_and_ancestors().collect();
        a.reverse(); // root first
        b.reverse();
        let mut lca = a[0].clone();
        for (x, y) in a.iter().zip(b.iter()) {
            if x.key == y.key {
                lca = x.clone();
            } else {
                break;
            }
        }
        lca
    }
}

pub struct AncestorIter {
    next: Option<TreeNode>,
}

impl Iterator for AncestorIter {
    type Item = TreeNode;
    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}

pub struct DescendantIter {
    stack: Vec<TreeNode>,
}

impl Iterator for DescendantIter {
    type Item = TreeNode;
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter().rev() {
            self.stack.push(child.clone());
        }
        Some(node)
    }
}

/// Declarative description of a node, as produced by a builder. This is the
/// boundary input type (spec'd shape); the engine validates it into an
/// immutable [`TreeNode`] at construction time.
pub struct NodeDef {
    pub key: StateKey,
    pub kind: NodeKind,
    pub children: Vec<NodeDef>,
    pub initial_child: Option<InitialChildFn>,
    pub data: Option<DataSpec>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub on_enter: Option<Arc<dyn EnterHandler>>,
    pub on_exit: Option<Arc<dyn ExitHandler>>,
    pub on_message: Option<Arc<dyn MessageHandler>>,
}

impl NodeDef {
    pub fn new(key: StateKey, kind: NodeKind) -> Self {
        Self {
            key,
            kind,
            children: Vec::new(),
            initial_child: None,
            data: None,
            filters: Vec::new(),
            metadata: HashMap::new(),
            on_enter: None,
            on_exit: None,
            on_message: None,
        }
    }

    pub fn child(mut self, child: NodeDef) -> Self {
        self.children.push(child);
        self
    }

    pub fn initial_child(mut self, f: InitialChildFn) -> Self {
        self.initial_child = Some(f);
        self
    }

    pub fn on_enter(mut self, h: Arc<dyn EnterHandler>) -> Self {
        self.on_enter = Some(h);
        self
    }

    pub fn on_exit(mut self, h: Arc<dyn ExitHandler>) -> Self {
        self.on_exit = Some(h);
        self
    }

    pub fn on_message(mut self, h: Arc<dyn MessageHandler>) -> Self {
        self.on_message = Some(h);
        self
    }

    pub fn filter(mut self, f: Arc<dyn Filter>) -> Self {
        self.filters.push(f);
        self
    }

    pub fn data(mut self, spec: DataSpec) -> Self {
        self.data = Some(spec);
        self
    }
}

/// Validates invariants I1-I7 and compiles a [`NodeDef`] tree into an
/// immutable, reference-counted [`TreeNode`] tree.
pub fn build_tree(root_def: NodeDef) -> EngineResult<TreeNode> {
    if root_def.kind != NodeKind::Root {
        return Err(EngineError::InvalidTree(
            "the outermost NodeDef must have kind Root".into(),
        ));
    }
    let mut seen = HashMap::new();
    validate_node_def(&root_def, None, true, &mut seen)?;
    Ok(construct_node(root_def, None))
}

fn validate_node_def(
    def: &NodeDef,
    parent_kind: Option<NodeKind>,
    is_root_position: bool,
    seen: &mut HashMap<StateKey, ()>,
) -> EngineResult<()> {
    if seen.insert(def.key.clone(), ()).is_some() {
        return Err(EngineError::InvalidTree(format!(
            "duplicate state key: {:?}",
            def.key
        )));
    }
    if def.kind == NodeKind::Root && !is_root_position {
        return Err(EngineError::InvalidTree(
            "only the outermost node may have kind Root".into(),
        ));
    }
    if def.kind == NodeKind::FinalLeaf {
        if parent_kind.is_some_and(|k| k != NodeKind::Root) {
            return Err(EngineError::InvalidTree(format!(
                "final leaf {:?} must be a direct child of the root",
                def.key
            )));
        }
    }
    if def.kind.is_leaf() && !def.children.is_empty() {
        return Err(EngineError::InvalidTree(format!(
            "leaf state {:?} may not have children",
            def.key
        )));
    }
    if def.kind.is_composite() && !def.children.is_empty() && def.initial_child.is_none() {
        return Err(EngineError::InvalidTree(format!(
            "composite state {:?} with children needs an initial-child selector",
            def.key
        )));
    }
    for child in &def.children {
        validate_node_def(child, Some(def.kind), false, seen)?;
    }
    Ok(())
}

/// Infallible now that [`validate_node_def`] has already accepted the tree.
/// Uses `Arc::new_cyclic` so every child's parent weak pointer resolves to
/// the exact, fully-built `Arc<Node>` the caller ends up holding.
fn construct_node(def: NodeDef, parent: Option<Weak<Node>>) -> TreeNode {
    let NodeDef {
        key,
        kind,
        children,
        initial_child,
        data,
        filters,
        metadata,
        on_enter,
        on_exit,
        on_message,
    } = def;

    Arc::new_cyclic(|weak_self| {
        let built_children = children
            .into_iter()
            .map(|child_def| construct_node(child_def, Some(weak_self.clone())))
            .collect();
        Node {
            key,
            kind,
            parent,
            children: built_children,
            initial_child,
            data,
            filters,
            metadata,
            on_enter,
            on_exit,
            on_message,
        }
    })
}

/// An index over a built tree for O(1) key -> node lookups, used by the
/// dispatcher and the snapshot codec.
pub struct TreeIndex {
    pub root: TreeNode,
    by_key: HashMap<StateKey, TreeNode>,
}

impl TreeIndex {
    pub fn build(root: TreeNode) -> Self {
        let by_key = root
            .self_and_descendants()
            .map(|n| (n.key.clone(), n))
            .collect();
        Self { root, by_key }
    }

    pub fn get(&self, key: &StateKey) -> EngineResult<TreeNode> {
        self.by_key
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::StateNotFound(key.clone()))
    }

    pub fn stopped_leaf(&self) -> TreeNode {
        self.get(&crate::scheduler::stopped_state_key())
            .expect("engine construction always inserts the stopped final leaf")
    }
}
