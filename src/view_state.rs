//! Host-side view-state managers: the per-node visibility, selection, opacity and highlight
//! colour state that the bridge mirrors into the engine.

use crate::native::NodeFlags;
use crate::token::NodeId;
use bitflags::bitflags;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewStateEvent {
    Visibility,
    Selection,
    Opacity,
    HighlightColor,
}

impl ViewStateEvent {
    pub const ALL: [ViewStateEvent; 4] =
        [ViewStateEvent::Visibility, ViewStateEvent::Selection, ViewStateEvent::Opacity, ViewStateEvent::HighlightColor];

    pub fn capability(self) -> ViewStateEvents {
        match self {
            ViewStateEvent::Visibility => ViewStateEvents::VISIBILITY,
            ViewStateEvent::Selection => ViewStateEvents::SELECTION,
            ViewStateEvent::Opacity => ViewStateEvents::OPACITY,
            ViewStateEvent::HighlightColor => ViewStateEvents::HIGHLIGHT_COLOR,
        }
    }
}

bitflags! {
    /// Change notifications a manager is able to publish.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ViewStateEvents: u8 {
        const VISIBILITY = 0x1;
        const SELECTION = 0x2;
        const OPACITY = 0x4;
        const HIGHLIGHT_COLOR = 0x8;
    }
}

/// One batch of changes published by a manager, in the order the nodes changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewStateChange {
    Visibility { visible: Vec<NodeId>, hidden: Vec<NodeId> },
    Selection { selected: Vec<NodeId>, unselected: Vec<NodeId> },
    Opacity { nodes: Vec<NodeId>, opacity: f32 },
    HighlightColor { nodes: Vec<NodeId>, color: u32 },
}

impl ViewStateChange {
    pub fn event(&self) -> ViewStateEvent {
        match self {
            ViewStateChange::Visibility { .. } => ViewStateEvent::Visibility,
            ViewStateChange::Selection { .. } => ViewStateEvent::Selection,
            ViewStateChange::Opacity { .. } => ViewStateEvent::Opacity,
            ViewStateChange::HighlightColor { .. } => ViewStateEvent::HighlightColor,
        }
    }
}

pub type ChangeListener = Rc<dyn Fn(&ViewStateChange)>;

/// Flag values a manager reports for a node. Only the bits in `known` carry an opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KnownFlags {
    pub flags: NodeFlags,
    pub known: NodeFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Capability set the bridge needs from a host view-state manager.
///
/// Getters return `None` when the manager has no opinion about a node. Listeners run
/// synchronously while the manager is mutably borrowed, so they must not call back into it.
pub trait ViewStateManager {
    fn supported_events(&self) -> ViewStateEvents;

    /// Flags of `node` restricted to `mask`, together with the bits of `mask` the manager
    /// actually knows. `None` when it knows none of them.
    fn node_flags(&self, node: &NodeId, mask: NodeFlags) -> Option<KnownFlags>;
    fn node_opacity(&self, node: &NodeId) -> Option<f32>;
    fn highlight_color(&self, node: &NodeId) -> Option<u32>;

    /// Sets the bits of `mask` to their values in `flags`.
    fn set_node_flags(&mut self, node: &NodeId, flags: NodeFlags, mask: NodeFlags);
    fn set_node_opacity(&mut self, node: &NodeId, opacity: f32);
    fn set_highlight_color(&mut self, node: &NodeId, color: u32);

    fn subscribe(&mut self, event: ViewStateEvent, listener: ChangeListener) -> SubscriptionId;
    /// Returns whether the subscription existed.
    fn unsubscribe(&mut self, event: ViewStateEvent, id: SubscriptionId) -> bool;
}

pub type SharedViewStateManager = Rc<RefCell<dyn ViewStateManager>>;

/// Identity of a shared manager, stable while the `Rc` is alive.
pub fn manager_key(manager: &SharedViewStateManager) -> usize {
    Rc::as_ptr(manager) as *const () as usize
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NodeState {
    flags: NodeFlags,
    known: NodeFlags,
    opacity: Option<f32>,
    highlight_color: Option<u32>,
}

/// Straightforward in-memory manager. Nodes start with no known state; only flags that have
/// been set are reported back.
pub struct BasicViewStateManager {
    nodes: HashMap<NodeId, NodeState>,
    listeners: Vec<(ViewStateEvent, SubscriptionId, ChangeListener)>,
    next_subscription: u64,
    events: ViewStateEvents,
}

impl Default for BasicViewStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicViewStateManager {
    pub fn new() -> Self {
        Self::with_events(ViewStateEvents::all())
    }

    /// A manager that only publishes `events`; attaching it to a renderer fails unless all four
    /// notifications are supported.
    pub fn with_events(events: ViewStateEvents) -> Self {
        Self { nodes: HashMap::new(), listeners: Vec::new(), next_subscription: 1, events }
    }

    pub fn shared(self) -> Rc<RefCell<BasicViewStateManager>> {
        Rc::new(RefCell::new(self))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn set_visible(&mut self, nodes: &[NodeId], visible: bool) {
        for node in nodes {
            let flags = if visible { NodeFlags::VISIBLE } else { NodeFlags::empty() };
            self.set_node_flags(node, flags, NodeFlags::VISIBLE);
        }
    }

    pub fn set_selected(&mut self, nodes: &[NodeId], selected: bool) {
        for node in nodes {
            let flags = if selected { NodeFlags::SELECTED } else { NodeFlags::empty() };
            self.set_node_flags(node, flags, NodeFlags::SELECTED);
        }
    }

    pub fn set_opacity(&mut self, nodes: &[NodeId], opacity: f32) {
        let changed: Vec<NodeId> = nodes
            .iter()
            .filter(|node| self.update(node, |state| replace_if_changed(&mut state.opacity, opacity)))
            .cloned()
            .collect();
        if !changed.is_empty() {
            self.emit(&ViewStateChange::Opacity { nodes: changed, opacity });
        }
    }

    pub fn set_highlight(&mut self, nodes: &[NodeId], color: u32) {
        let changed: Vec<NodeId> = nodes
            .iter()
            .filter(|node| self.update(node, |state| replace_if_changed(&mut state.highlight_color, color)))
            .cloned()
            .collect();
        if !changed.is_empty() {
            self.emit(&ViewStateChange::HighlightColor { nodes: changed, color });
        }
    }

    fn update(&mut self, node: &NodeId, f: impl FnOnce(&mut NodeState) -> bool) -> bool {
        f(self.nodes.entry(node.clone()).or_default())
    }

    fn emit(&self, change: &ViewStateChange) {
        let event = change.event();
        let listeners: Vec<ChangeListener> = self
            .listeners
            .iter()
            .filter(|(kind, _, _)| *kind == event)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

fn replace_if_changed<T: PartialEq + Copy>(slot: &mut Option<T>, value: T) -> bool {
    if *slot == Some(value) {
        false
    } else {
        *slot = Some(value);
        true
    }
}

impl ViewStateManager for BasicViewStateManager {
    fn supported_events(&self) -> ViewStateEvents {
        self.events
    }

    fn node_flags(&self, node: &NodeId, mask: NodeFlags) -> Option<KnownFlags> {
        let state = self.nodes.get(node)?;
        let known = state.known & mask;
        if known.is_empty() {
            return None;
        }
        Some(KnownFlags { flags: state.flags & known, known })
    }

    fn node_opacity(&self, node: &NodeId) -> Option<f32> {
        self.nodes.get(node).and_then(|state| state.opacity)
    }

    fn highlight_color(&self, node: &NodeId) -> Option<u32> {
        self.nodes.get(node).and_then(|state| state.highlight_color)
    }

    fn set_node_flags(&mut self, node: &NodeId, flags: NodeFlags, mask: NodeFlags) {
        let previous = self.nodes.get(node).copied().unwrap_or_default();
        let state = self.nodes.entry(node.clone()).or_default();
        state.flags = (state.flags & !mask) | (flags & mask);
        state.known |= mask;
        let current = *state;

        let toggled = |flag: NodeFlags| {
            mask.contains(flag)
                && (!previous.known.contains(flag) || previous.flags.contains(flag) != current.flags.contains(flag))
        };
        if toggled(NodeFlags::VISIBLE) {
            let (visible, hidden) = if current.flags.contains(NodeFlags::VISIBLE) {
                (vec![node.clone()], Vec::new())
            } else {
                (Vec::new(), vec![node.clone()])
            };
            self.emit(&ViewStateChange::Visibility { visible, hidden });
        }
        if toggled(NodeFlags::SELECTED) {
            let (selected, unselected) = if current.flags.contains(NodeFlags::SELECTED) {
                (vec![node.clone()], Vec::new())
            } else {
                (Vec::new(), vec![node.clone()])
            };
            self.emit(&ViewStateChange::Selection { selected, unselected });
        }
    }

    fn set_node_opacity(&mut self, node: &NodeId, opacity: f32) {
        self.set_opacity(std::slice::from_ref(node), opacity);
    }

    fn set_highlight_color(&mut self, node: &NodeId, color: u32) {
        self.set_highlight(std::slice::from_ref(node), color);
    }

    fn subscribe(&mut self, event: ViewStateEvent, listener: ChangeListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((event, id, listener));
        id
    }

    fn unsubscribe(&mut self, event: ViewStateEvent, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(kind, existing, _)| !(*kind == event && *existing == id));
        self.listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder(manager: &mut BasicViewStateManager, event: ViewStateEvent) -> Rc<RefCell<Vec<ViewStateChange>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        manager.subscribe(event, Rc::new(move |change: &ViewStateChange| sink.borrow_mut().push(change.clone())));
        log
    }

    #[test]
    fn unknown_state_reports_no_opinion() {
        let manager = BasicViewStateManager::new();
        let node = NodeId::from_address(0x40);
        assert_eq!(manager.node_flags(&node, NodeFlags::all()), None);
        assert_eq!(manager.node_opacity(&node), None);
        assert_eq!(manager.highlight_color(&node), None);
    }

    #[test]
    fn flag_changes_publish_only_real_transitions() {
        let mut manager = BasicViewStateManager::new();
        let visibility = recorder(&mut manager, ViewStateEvent::Visibility);
        let node = NodeId::from_address(0x40);
        manager.set_visible(&[node.clone()], true);
        manager.set_visible(&[node.clone()], true);
        manager.set_visible(&[node.clone()], false);
        let log = visibility.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], ViewStateChange::Visibility { visible: vec![], hidden: vec![node.clone()] });
        let hidden = KnownFlags { flags: NodeFlags::empty(), known: NodeFlags::VISIBLE };
        assert_eq!(manager.node_flags(&node, NodeFlags::VISIBLE), Some(hidden));
        assert_eq!(manager.node_flags(&node, NodeFlags::VISIBLE | NodeFlags::SELECTED), Some(hidden));
        assert_eq!(manager.node_flags(&node, NodeFlags::SELECTED), None);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut manager = BasicViewStateManager::new();
        let log = Rc::new(RefCell::new(0));
        let sink = log.clone();
        let id = manager.subscribe(ViewStateEvent::Opacity, Rc::new(move |_: &ViewStateChange| *sink.borrow_mut() += 1));
        let node = NodeId::from_address(0x40);
        manager.set_opacity(&[node.clone()], 0.5);
        assert!(manager.unsubscribe(ViewStateEvent::Opacity, id));
        assert!(!manager.unsubscribe(ViewStateEvent::Opacity, id));
        manager.set_opacity(&[node], 0.25);
        assert_eq!(*log.borrow(), 1);
        assert_eq!(manager.listener_count(), 0);
    }
}
