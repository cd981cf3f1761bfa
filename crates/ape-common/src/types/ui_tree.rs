//! Concrete UI tree snapshots
//!
//! A snapshot is delivered by the platform collaborator as a nested JSON
//! document and flattened here into an arena of nodes. Node 0 is the root;
//! every other node records its parent and its children in document order.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApeError, Result};

/// Index of a node inside one [`UiTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a stored snapshot, assigned by the model in arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId(pub u32);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Screen rectangle, serialized in the platform form `[l,t][r,b]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Zero-area rectangles are treated as invisible
    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    pub fn contains(&self, other: &Rect) -> bool {
        !self.is_empty()
            && self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.left <= x && x < self.right && self.top <= y && y < self.bottom
    }

    pub fn union(&self, other: &Rect) -> Rect {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    pub fn center_x(&self) -> i32 {
        (self.left + self.right) / 2
    }

    pub fn center_y(&self) -> i32 {
        (self.top + self.bottom) / 2
    }

    /// Parse `[l,t][r,b]`
    pub fn parse(s: &str) -> Option<Rect> {
        let nums: Vec<i32> = s
            .split(|c: char| c == '[' || c == ']' || c == ',')
            .filter(|p| !p.trim().is_empty())
            .map(|p| p.trim().parse::<i32>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        match nums.as_slice() {
            [l, t, r, b] => Some(Rect::new(*l, *t, *r, *b)),
            _ => None,
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

impl TryFrom<String> for Rect {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Rect::parse(&value).ok_or_else(|| format!("invalid bounds: {}", value))
    }
}

impl From<Rect> for String {
    fn from(r: Rect) -> Self {
        r.to_string()
    }
}

/// Scroll capability derived from the widget class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollType {
    None,
    Vertical,
    Horizontal,
    All,
}

impl ScrollType {
    const VERTICAL: [&'static str; 4] = [
        "android.widget.ScrollView",
        "android.widget.ListView",
        "android.widget.ExpandableListView",
        "android.support.v17.leanback.widget.VerticalGridView",
    ];

    const HORIZONTAL: [&'static str; 3] = [
        "android.widget.HorizontalScrollView",
        "android.support.v17.leanback.widget.HorizontalGridView",
        "android.support.v4.view.ViewPager",
    ];

    pub fn classify(class_name: &str, scrollable: bool) -> ScrollType {
        if !scrollable {
            return ScrollType::None;
        }
        if Self::VERTICAL.contains(&class_name) {
            return ScrollType::Vertical;
        }
        if Self::HORIZONTAL.contains(&class_name) {
            return ScrollType::Horizontal;
        }
        ScrollType::All
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScrollType::None => "none",
            ScrollType::Vertical => "vertical",
            ScrollType::Horizontal => "horizontal",
            ScrollType::All => "all",
        }
    }
}

const EDIT_TEXT_CLASSES: [&str; 4] = [
    "android.widget.EditText",
    "android.inputmethodservice.ExtractEditText",
    "android.widget.AutoCompleteTextView",
    "android.widget.MultiAutoCompleteTextView",
];

/// Whether widgets of this class accept text input
pub fn is_edit_text(class_name: &str) -> bool {
    EDIT_TEXT_CLASSES.contains(&class_name)
}

/// One node as delivered by the collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawNode {
    pub index: Option<u32>,
    pub text: String,
    #[serde(rename = "resource-id")]
    pub resource_id: String,
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(rename = "package")]
    pub package: String,
    #[serde(rename = "content-desc")]
    pub content_desc: String,
    pub checkable: bool,
    pub checked: bool,
    pub clickable: bool,
    pub enabled: bool,
    pub focusable: bool,
    pub focused: bool,
    pub scrollable: bool,
    #[serde(rename = "long-clickable")]
    pub long_clickable: bool,
    pub password: bool,
    pub bounds: Rect,
    pub children: Vec<RawNode>,
}

/// A snapshot document: foreground activity plus root node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub activity: String,
    pub root: RawNode,
}

/// Flattened node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiNode {
    pub index: u32,
    pub text: String,
    pub resource_id: String,
    pub class_name: String,
    pub package: String,
    pub content_desc: String,
    pub checkable: bool,
    pub checked: bool,
    pub clickable: bool,
    pub enabled: bool,
    pub focusable: bool,
    pub focused: bool,
    pub scrollable: bool,
    pub long_clickable: bool,
    pub password: bool,
    pub bounds: Rect,
    pub scroll_type: ScrollType,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl UiNode {
    fn from_raw(raw: &RawNode, position: u32, parent: Option<NodeId>) -> Self {
        Self {
            index: raw.index.unwrap_or(position),
            text: raw.text.clone(),
            resource_id: raw.resource_id.clone(),
            class_name: raw.class_name.clone(),
            package: raw.package.clone(),
            content_desc: raw.content_desc.clone(),
            checkable: raw.checkable,
            checked: raw.checked,
            clickable: raw.clickable,
            enabled: raw.enabled,
            focusable: raw.focusable,
            focused: raw.focused,
            scrollable: raw.scrollable,
            long_clickable: raw.long_clickable,
            password: raw.password,
            bounds: raw.bounds,
            scroll_type: ScrollType::classify(&raw.class_name, raw.scrollable),
            parent,
            children: Vec::new(),
        }
    }

    pub fn is_edit_text(&self) -> bool {
        is_edit_text(&self.class_name)
    }

    pub fn is_web_view(&self) -> bool {
        self.class_name.contains("WebView")
    }

    /// Text used for naming; editable widgets contribute no text
    pub fn naming_text(&self) -> &str {
        if self.is_edit_text() {
            ""
        } else {
            &self.text
        }
    }

    /// Attribute lookup for selector evaluation
    pub fn attribute(&self, name: &str) -> Option<String> {
        let value = match name {
            "index" => self.index.to_string(),
            "text" => self.naming_text().to_string(),
            "resource-id" => self.resource_id.clone(),
            "class" => self.class_name.clone(),
            "package" => self.package.clone(),
            "content-desc" => self.content_desc.clone(),
            "checkable" => self.checkable.to_string(),
            "checked" => self.checked.to_string(),
            "clickable" => self.clickable.to_string(),
            "enabled" => self.enabled.to_string(),
            "focusable" => self.focusable.to_string(),
            "focused" => self.focused.to_string(),
            "scrollable" => self.scrollable.to_string(),
            "long-clickable" => self.long_clickable.to_string(),
            "password" => self.password.to_string(),
            "scroll-type" => self.scroll_type.as_str().to_string(),
            "bounds" => self.bounds.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Whether the node offers any model action
    pub fn has_action(&self) -> bool {
        self.clickable || self.long_clickable || self.checkable || self.scrollable
    }

    fn same_attributes(&self, other: &UiNode) -> bool {
        self.index == other.index
            && self.class_name == other.class_name
            && self.package == other.package
            && self.resource_id == other.resource_id
            && self.enabled == other.enabled
            && self.text == other.text
            && self.content_desc == other.content_desc
            && self.clickable == other.clickable
            && self.checkable == other.checkable
            && self.long_clickable == other.long_clickable
            && self.scrollable == other.scrollable
    }
}

/// Options applied while flattening a snapshot
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    /// Drop subtrees with zero-area bounds
    pub ignore_empty: bool,
    /// Drop subtrees that do not intersect the root
    pub ignore_out_of_bounds: bool,
    /// Move container click handlers onto their children
    pub patch_clickable_containers: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            ignore_empty: true,
            ignore_out_of_bounds: true,
            patch_clickable_containers: true,
        }
    }
}

/// Arena-backed UI tree of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiTree {
    activity: String,
    nodes: Vec<UiNode>,
}

impl UiTree {
    /// Flatten a collaborator snapshot
    pub fn build(snapshot: &RawSnapshot, options: &TreeOptions) -> Result<Self> {
        let root_bounds = snapshot.root.bounds;
        let mut nodes = vec![UiNode::from_raw(&snapshot.root, 0, None)];
        let mut queue: VecDeque<(NodeId, &RawNode)> = VecDeque::new();
        queue.push_back((NodeId::ROOT, &snapshot.root));

        while let Some((id, raw)) = queue.pop_front() {
            for (position, child) in raw.children.iter().enumerate() {
                if options.ignore_empty && child.bounds.is_empty() {
                    continue;
                }
                if options.ignore_out_of_bounds && !child.bounds.intersects(&root_bounds) {
                    continue;
                }
                let child_id = NodeId(nodes.len() as u32);
                nodes.push(UiNode::from_raw(child, position as u32, Some(id)));
                nodes[id.index()].children.push(child_id);
                queue.push_back((child_id, child));
            }
        }

        let mut tree = Self {
            activity: snapshot.activity.clone(),
            nodes,
        };
        if options.patch_clickable_containers {
            tree.patch_clickable_containers(NodeId::ROOT);
        }
        Ok(tree)
    }

    /// Parse a JSON snapshot document
    pub fn from_json(json: &str, options: &TreeOptions) -> Result<Self> {
        let snapshot: RawSnapshot = serde_json::from_str(json)?;
        Self::build(&snapshot, options)
    }

    /// Build directly from flattened nodes; node 0 must be the root
    pub fn from_nodes(activity: impl Into<String>, nodes: Vec<UiNode>) -> Result<Self> {
        if nodes.is_empty() || nodes[0].parent.is_some() {
            return Err(ApeError::Internal("tree must start with a root node".into()));
        }
        Ok(Self {
            activity: activity.into(),
            nodes,
        })
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn root(&self) -> &UiNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &UiNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&UiNode> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    /// Breadth-first order starting at the root
    pub fn breadth_first(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([NodeId::ROOT]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            queue.extend(self.children(id).iter().copied());
        }
        order
    }

    /// Structural comparison of the widget attributes of two trees
    pub fn is_isomorphic(&self, other: &UiTree) -> bool {
        self.isomorphic_at(NodeId::ROOT, other, NodeId::ROOT)
    }

    fn isomorphic_at(&self, a: NodeId, other: &UiTree, b: NodeId) -> bool {
        let na = self.node(a);
        let nb = other.node(b);
        if !na.same_attributes(nb) || na.children.len() != nb.children.len() {
            return false;
        }
        na.children
            .iter()
            .zip(nb.children.iter())
            .all(|(ca, cb)| self.isomorphic_at(*ca, other, *cb))
    }

    /// Content digest used to name persisted artifacts
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.activity.as_bytes());
        for node in &self.nodes {
            hasher.update(&node.index.to_le_bytes());
            hasher.update(node.class_name.as_bytes());
            hasher.update(node.resource_id.as_bytes());
            hasher.update(node.text.as_bytes());
            hasher.update(node.content_desc.as_bytes());
            hasher.update(node.bounds.to_string().as_bytes());
            hasher.update(&[node.children.len() as u8]);
        }
        hasher.finalize().to_hex()[..16].to_string()
    }

    fn patch_clickable_containers(&mut self, id: NodeId) {
        let children = self.children(id).to_vec();
        if children.is_empty() || self.node(id).is_web_view() {
            return;
        }
        let node_bounds = self.node(id).bounds;
        let children_bounds = children
            .iter()
            .fold(Rect::default(), |acc, c| acc.union(&self.node(*c).bounds));

        if node_bounds.contains(&children_bounds) && self.should_patch_children(id) {
            debug!(
                class = %self.node(id).class_name,
                resource_id = %self.node(id).resource_id,
                "patching clickable container"
            );
            let single = children.len() == 1;
            let parent_index = self.node(id).index;
            for child in &children {
                let node = &mut self.nodes[child.index()];
                if !node.clickable {
                    node.clickable = true;
                    if single {
                        node.index = parent_index;
                    }
                }
            }
            if children_bounds.contains_point(node_bounds.center_x(), node_bounds.center_y()) {
                self.nodes[id.index()].clickable = false;
            }
        }

        for child in children {
            self.patch_clickable_containers(child);
        }
    }

    fn should_patch_children(&self, id: NodeId) -> bool {
        let node = self.node(id);
        if !node.clickable || node.children.is_empty() {
            return false;
        }
        if node.children.len() == 1 {
            return true;
        }
        let bounds: Vec<Rect> = node.children.iter().map(|c| self.node(*c).bounds).collect();
        let same_row = bounds
            .iter()
            .all(|b| b.top == bounds[0].top && b.bottom == bounds[0].bottom);
        let same_column = bounds
            .iter()
            .all(|b| b.left == bounds[0].left && b.right == bounds[0].right);
        same_row || same_column
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(class: &str, text: &str, bounds: Rect) -> RawNode {
        RawNode {
            class_name: class.to_string(),
            text: text.to_string(),
            enabled: true,
            bounds,
            ..Default::default()
        }
    }

    fn sample() -> RawSnapshot {
        let mut root = leaf("android.widget.FrameLayout", "", Rect::new(0, 0, 100, 200));
        let mut list = leaf("android.widget.ListView", "", Rect::new(0, 0, 100, 200));
        list.scrollable = true;
        list.children.push(leaf("android.widget.TextView", "a", Rect::new(0, 0, 100, 50)));
        list.children.push(leaf("android.widget.TextView", "b", Rect::new(0, 50, 100, 100)));
        root.children.push(list);
        root.children.push(leaf("android.widget.Button", "hidden", Rect::new(0, 0, 0, 0)));
        root.children.push(leaf("android.widget.Button", "off", Rect::new(500, 500, 600, 600)));
        RawSnapshot {
            activity: "com.example.Main".to_string(),
            root,
        }
    }

    #[test]
    fn test_build_filters_invisible_nodes() {
        let tree = UiTree::build(&sample(), &TreeOptions::default()).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.children(NodeId::ROOT).len(), 1);
        let list = tree.children(NodeId::ROOT)[0];
        assert_eq!(tree.node(list).scroll_type, ScrollType::Vertical);
        assert_eq!(tree.node(tree.children(list)[1]).index, 1);
    }

    #[test]
    fn test_build_keeps_everything_without_filters() {
        let options = TreeOptions {
            ignore_empty: false,
            ignore_out_of_bounds: false,
            patch_clickable_containers: false,
        };
        let tree = UiTree::build(&sample(), &options).unwrap();
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_rect_parse_and_display() {
        let r = Rect::parse("[0,10][1080,1920]").unwrap();
        assert_eq!(r, Rect::new(0, 10, 1080, 1920));
        assert_eq!(r.to_string(), "[0,10][1080,1920]");
        assert!(Rect::parse("[0,10]").is_none());
    }

    #[test]
    fn test_edit_text_has_no_naming_text() {
        let mut raw = sample();
        raw.root.children[0].children[0].class_name = "android.widget.EditText".into();
        let tree = UiTree::build(&raw, &TreeOptions::default()).unwrap();
        let list = tree.children(NodeId::ROOT)[0];
        let edit = tree.children(list)[0];
        assert_eq!(tree.node(edit).naming_text(), "");
        assert_eq!(tree.node(edit).attribute("text").as_deref(), Some(""));
    }

    #[test]
    fn test_clickable_container_is_patched() {
        let mut raw = sample();
        raw.root.children[0].clickable = true;
        let tree = UiTree::build(&raw, &TreeOptions::default()).unwrap();
        let list = tree.children(NodeId::ROOT)[0];
        for child in tree.children(list) {
            assert!(tree.node(*child).clickable);
        }
    }

    #[test]
    fn test_isomorphism_and_digest() {
        let a = UiTree::build(&sample(), &TreeOptions::default()).unwrap();
        let b = UiTree::build(&sample(), &TreeOptions::default()).unwrap();
        assert!(a.is_isomorphic(&b));
        assert_eq!(a.digest(), b.digest());

        let mut raw = sample();
        raw.root.children[0].children[1].text = "changed".into();
        let c = UiTree::build(&raw, &TreeOptions::default()).unwrap();
        assert!(!a.is_isomorphic(&c));
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_json_snapshot() {
        let json = r#"{
            "activity": "com.example.Main",
            "root": {
                "class": "android.widget.FrameLayout",
                "bounds": "[0,0][100,100]",
                "enabled": true,
                "children": [
                    {"class": "android.widget.Button", "text": "OK", "clickable": true,
                     "bounds": "[0,0][50,50]", "resource-id": "ok"}
                ]
            }
        }"#;
        let tree = UiTree::from_json(json, &TreeOptions::default()).unwrap();
        assert_eq!(tree.activity(), "com.example.Main");
        let button = tree.children(NodeId::ROOT)[0];
        assert_eq!(tree.node(button).resource_id, "ok");
        assert_eq!(tree.breadth_first(), vec![NodeId(0), NodeId(1)]);
    }

    proptest::proptest! {
        #[test]
        fn test_union_contains_both(
            a in (0i32..500, 0i32..500, 1i32..500, 1i32..500),
            b in (0i32..500, 0i32..500, 1i32..500, 1i32..500),
        ) {
            let ra = Rect::new(a.0, a.1, a.0 + a.2, a.1 + a.3);
            let rb = Rect::new(b.0, b.1, b.0 + b.2, b.1 + b.3);
            let u = ra.union(&rb);
            proptest::prop_assert!(u.contains(&ra));
            proptest::prop_assert!(u.contains(&rb));
        }
    }
}
