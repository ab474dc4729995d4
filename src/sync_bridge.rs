//! Two-way synchronisation of per-node view state between host managers and native
//! view-state-manager handles.
//!
//! One native handle exists per distinct host manager, shared by every renderer attached to
//! that manager. Host notifications are pushed into the engine synchronously; the engine pulls
//! state back through [`NodeStateProvider`] using the packed [`PropertyRecord`] protocol.

use crate::native::{
    check_handle, check_status, NativeAddr, NativeEngine, NativeError, NodeFlags, NodeStateProvider, PropertyMask,
    PropertyRecord,
};
use crate::registry::ResourceRegistry;
use crate::token::{NodeId, RendererToken};
use crate::view_state::{
    manager_key, ChangeListener, SharedViewStateManager, SubscriptionId, ViewStateChange, ViewStateEvent,
    ViewStateEvents,
};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("renderer {0} is not live")]
    StaleRenderer(RendererToken),
    #[error("view-state manager does not publish required notifications {missing:?}")]
    MissingCapability { missing: ViewStateEvents },
    #[error(transparent)]
    Native(#[from] NativeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeProperty {
    Visibility,
    Selection,
    Opacity,
    HighlightColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Unsynced,
    PendingNativeToHost,
    PendingHostToNative,
    Synced,
}

struct Association {
    manager: SharedViewStateManager,
    key: usize,
    renderers: SmallVec<[RendererToken; 4]>,
    subscriptions: Vec<(ViewStateEvent, SubscriptionId)>,
}

#[derive(Default)]
struct BridgeState {
    associations: BTreeMap<NativeAddr, Association>,
    renderers: HashMap<RendererToken, NativeAddr>,
    sync_states: HashMap<(NativeAddr, NativeAddr, NodeProperty), SyncState>,
}

impl BridgeState {
    fn handle_for_manager(&self, key: usize) -> Option<NativeAddr> {
        self.associations.iter().find(|(_, association)| association.key == key).map(|(handle, _)| *handle)
    }

    fn mark(&mut self, handle: NativeAddr, node: NativeAddr, property: NodeProperty, state: SyncState) {
        self.sync_states.insert((handle, node, property), state);
    }
}

pub struct ViewStateSyncBridge {
    engine: Rc<dyn NativeEngine>,
    state: RefCell<BridgeState>,
    applying_native: Cell<Option<NativeAddr>>,
    self_ref: Weak<ViewStateSyncBridge>,
}

impl ViewStateSyncBridge {
    /// Creates the bridge and registers it as the engine's node-state provider.
    pub fn new(engine: Rc<dyn NativeEngine>) -> Rc<Self> {
        let bridge = Rc::new_cyclic(|weak| Self {
            engine: engine.clone(),
            state: RefCell::new(BridgeState::default()),
            applying_native: Cell::new(None),
            self_ref: weak.clone(),
        });
        let provider: Weak<dyn NodeStateProvider> = Rc::downgrade(&bridge) as Weak<Self>;
        engine.set_node_state_provider(provider);
        bridge
    }

    /// Attaches `renderer` to `manager`, or detaches it when `manager` is `None`.
    pub fn set_view_state_manager(
        &self,
        registry: &ResourceRegistry,
        renderer: RendererToken,
        manager: Option<SharedViewStateManager>,
    ) -> Result<(), SyncError> {
        if !registry.is_live(renderer.token()) {
            return Err(SyncError::StaleRenderer(renderer));
        }
        match manager {
            Some(manager) => self.attach(renderer, manager),
            None => {
                self.detach_renderer(renderer);
                Ok(())
            }
        }
    }

    fn attach(&self, renderer: RendererToken, manager: SharedViewStateManager) -> Result<(), SyncError> {
        let supported = manager.borrow().supported_events();
        let missing = ViewStateEvents::all().difference(supported);
        if !missing.is_empty() {
            return Err(SyncError::MissingCapability { missing });
        }

        let key = manager_key(&manager);
        let (current, existing) = {
            let state = self.state.borrow();
            (state.renderers.get(&renderer).copied(), state.handle_for_manager(key))
        };
        if current.is_some() && current == existing {
            return Ok(());
        }
        if current.is_some() {
            self.detach_renderer(renderer);
        }

        if let Some(handle) = existing {
            check_status(self.engine.bind_view_state_manager(renderer.address(), Some(handle)))?;
            let mut state = self.state.borrow_mut();
            if let Some(association) = state.associations.get_mut(&handle) {
                association.renderers.push(renderer);
            }
            state.renderers.insert(renderer, handle);
            debug!(renderer = %renderer, handle, "reusing native view-state handle");
            return Ok(());
        }

        let handle = check_handle(self.engine.create_view_state_manager())?;
        if let Err(err) = check_status(self.engine.bind_view_state_manager(renderer.address(), Some(handle))) {
            self.destroy_handle(handle);
            return Err(err.into());
        }
        let subscriptions: Vec<_> = {
            let mut host = manager.borrow_mut();
            ViewStateEvent::ALL
                .into_iter()
                .map(|event| (event, host.subscribe(event, self.listener(handle))))
                .collect()
        };
        let mut state = self.state.borrow_mut();
        let mut renderers = SmallVec::new();
        renderers.push(renderer);
        state.associations.insert(handle, Association { manager, key, renderers, subscriptions });
        state.renderers.insert(renderer, handle);
        info!(renderer = %renderer, handle, "created native view-state handle");
        Ok(())
    }

    /// Removes `renderer` from its association, tearing the association down when no renderer
    /// is left. Returns whether the renderer was attached.
    pub fn detach_renderer(&self, renderer: RendererToken) -> bool {
        let Some(handle) = self.state.borrow_mut().renderers.remove(&renderer) else {
            return false;
        };
        if let Err(err) = check_status(self.engine.bind_view_state_manager(renderer.address(), None)) {
            warn!(renderer = %renderer, handle, %err, "failed to unbind view-state handle");
        }

        let released = {
            let mut state = self.state.borrow_mut();
            let empty = match state.associations.get_mut(&handle) {
                Some(association) => {
                    association.renderers.retain(|attached| *attached != renderer);
                    association.renderers.is_empty()
                }
                None => false,
            };
            if empty {
                state.sync_states.retain(|(owner, _, _), _| *owner != handle);
                state.associations.remove(&handle)
            } else {
                None
            }
        };

        if let Some(association) = released {
            {
                let mut host = association.manager.borrow_mut();
                for (event, id) in &association.subscriptions {
                    if !host.unsubscribe(*event, *id) {
                        warn!(handle, ?event, "host subscription was already gone");
                    }
                }
            }
            self.destroy_handle(handle);
            info!(handle, "destroyed native view-state handle");
        }
        true
    }

    fn destroy_handle(&self, handle: NativeAddr) {
        if let Err(err) = check_status(self.engine.destroy_view_state_manager(handle)) {
            warn!(handle, %err, "failed to destroy view-state handle");
        }
    }

    fn listener(&self, handle: NativeAddr) -> ChangeListener {
        let bridge = self.self_ref.clone();
        Rc::new(move |change: &ViewStateChange| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.propagate_host_change(handle, change);
            }
        })
    }

    /// Pushes one host notification into the engine, node by node, in change-set order.
    pub fn propagate_host_change(&self, handle: NativeAddr, change: &ViewStateChange) {
        if !self.state.borrow().associations.contains_key(&handle) {
            return;
        }
        let echo = self.applying_native.get() == Some(handle);
        let engine = self.engine.as_ref();
        let fire = |node: &NodeId, property: NodeProperty, call: &dyn Fn(NativeAddr) -> i64| {
            let Some(address) = node.address() else {
                debug!(node = %node, "skipping node id outside the pointer scheme");
                return;
            };
            if echo {
                self.state.borrow_mut().mark(handle, address, property, SyncState::Synced);
                return;
            }
            self.state.borrow_mut().mark(handle, address, property, SyncState::PendingHostToNative);
            let next = match check_status(call(address)) {
                Ok(_) => SyncState::Synced,
                Err(err) => {
                    warn!(handle, node = %node, ?property, %err, "native rejected node change");
                    SyncState::Unsynced
                }
            };
            self.state.borrow_mut().mark(handle, address, property, next);
        };

        match change {
            ViewStateChange::Visibility { visible, hidden } => {
                for node in visible {
                    fire(node, NodeProperty::Visibility, &|addr| engine.fire_node_visibility_changed(handle, addr, true));
                }
                for node in hidden {
                    fire(node, NodeProperty::Visibility, &|addr| engine.fire_node_visibility_changed(handle, addr, false));
                }
            }
            ViewStateChange::Selection { selected, unselected } => {
                for node in selected {
                    fire(node, NodeProperty::Selection, &|addr| engine.fire_node_selection_changed(handle, addr, true));
                }
                for node in unselected {
                    fire(node, NodeProperty::Selection, &|addr| engine.fire_node_selection_changed(handle, addr, false));
                }
            }
            ViewStateChange::Opacity { nodes, opacity } => {
                for node in nodes {
                    fire(node, NodeProperty::Opacity, &|addr| engine.fire_node_opacity_changed(handle, addr, *opacity));
                }
            }
            ViewStateChange::HighlightColor { nodes, color } => {
                for node in nodes {
                    fire(node, NodeProperty::HighlightColor, &|addr| {
                        engine.fire_node_highlight_color_changed(handle, addr, *color)
                    });
                }
            }
        }
    }

    /// Raw variant of [`NodeStateProvider::get_node_state`] for engines that hand over a record
    /// living in engine memory.
    pub fn get_node_state_raw(&self, handle: NativeAddr, node: NativeAddr, record: NativeAddr) -> Result<(), SyncError> {
        let mut bytes = [0u8; PropertyRecord::SIZE];
        check_status(self.engine.read_memory(record, &mut bytes))?;
        let mut value: PropertyRecord = bytemuck::pod_read_unaligned(&bytes);
        self.get_node_state(handle, node, &mut value);
        check_status(self.engine.write_memory(record, bytemuck::bytes_of(&value)))?;
        Ok(())
    }

    pub fn set_node_state_raw(&self, handle: NativeAddr, node: NativeAddr, record: NativeAddr) -> Result<(), SyncError> {
        let mut bytes = [0u8; PropertyRecord::SIZE];
        check_status(self.engine.read_memory(record, &mut bytes))?;
        let value: PropertyRecord = bytemuck::pod_read_unaligned(&bytes);
        self.set_node_state(handle, node, &value);
        Ok(())
    }

    pub fn association_count(&self) -> usize {
        self.state.borrow().associations.len()
    }

    pub fn is_attached(&self, renderer: RendererToken) -> bool {
        self.state.borrow().renderers.contains_key(&renderer)
    }

    pub fn native_handle_for(&self, renderer: RendererToken) -> Option<NativeAddr> {
        self.state.borrow().renderers.get(&renderer).copied()
    }

    pub fn handle_for_manager(&self, manager: &SharedViewStateManager) -> Option<NativeAddr> {
        self.state.borrow().handle_for_manager(manager_key(manager))
    }

    pub fn renderers_for(&self, handle: NativeAddr) -> Vec<RendererToken> {
        self.state
            .borrow()
            .associations
            .get(&handle)
            .map(|association| association.renderers.to_vec())
            .unwrap_or_default()
    }

    pub fn sync_state(&self, handle: NativeAddr, node: NativeAddr, property: NodeProperty) -> SyncState {
        self.state.borrow().sync_states.get(&(handle, node, property)).copied().unwrap_or_default()
    }

    fn manager_for(&self, handle: NativeAddr) -> Option<SharedViewStateManager> {
        self.state.borrow().associations.get(&handle).map(|association| association.manager.clone())
    }

    fn mark_all(&self, handle: NativeAddr, node: NativeAddr, properties: &[NodeProperty], state: SyncState) {
        let mut bridge_state = self.state.borrow_mut();
        for property in properties {
            bridge_state.mark(handle, node, *property, state);
        }
    }
}

fn flag_properties(mask: NodeFlags) -> SmallVec<[NodeProperty; 2]> {
    let mut properties = SmallVec::new();
    if mask.contains(NodeFlags::VISIBLE) {
        properties.push(NodeProperty::Visibility);
    }
    if mask.contains(NodeFlags::SELECTED) {
        properties.push(NodeProperty::Selection);
    }
    properties
}

impl NodeStateProvider for ViewStateSyncBridge {
    fn get_node_state(&self, handle: NativeAddr, node: NativeAddr, record: &mut PropertyRecord) {
        let requested = record.property_mask();
        let flags_mask = record.node_flags_mask();
        record.mask = 0;
        let Some(manager) = self.manager_for(handle) else {
            return;
        };
        let Ok(host) = manager.try_borrow() else {
            warn!(handle, node, "host view-state manager busy during node query");
            return;
        };
        let id = NodeId::from_address(node);
        let mut response = PropertyMask::empty();
        let mut synced: SmallVec<[NodeProperty; 4]> = SmallVec::new();

        if requested.contains(PropertyMask::FLAGS) {
            if let Some(reported) = host.node_flags(&id, flags_mask) {
                let known = reported.known & flags_mask;
                if !known.is_empty() {
                    record.flags = (reported.flags & known).bits();
                    record.flags_mask = known.bits();
                    response |= PropertyMask::FLAGS;
                    synced.extend(flag_properties(known));
                }
            }
        }
        if requested.contains(PropertyMask::OPACITY) {
            if let Some(opacity) = host.node_opacity(&id) {
                record.opacity = opacity;
                response |= PropertyMask::OPACITY;
                synced.push(NodeProperty::Opacity);
            }
        }
        if requested.contains(PropertyMask::HIGHLIGHT_COLOR) {
            if let Some(color) = host.highlight_color(&id) {
                record.highlight_color = color;
                response |= PropertyMask::HIGHLIGHT_COLOR;
                synced.push(NodeProperty::HighlightColor);
            }
        }
        drop(host);
        record.mask = response.bits();
        self.mark_all(handle, node, &synced, SyncState::Synced);
    }

    fn set_node_state(&self, handle: NativeAddr, node: NativeAddr, record: &PropertyRecord) {
        let Some(manager) = self.manager_for(handle) else {
            return;
        };
        let mask = record.property_mask();
        let mut touched: SmallVec<[NodeProperty; 4]> = SmallVec::new();
        if mask.contains(PropertyMask::FLAGS) {
            touched.extend(flag_properties(record.node_flags_mask()));
        }
        if mask.contains(PropertyMask::OPACITY) {
            touched.push(NodeProperty::Opacity);
        }
        if mask.contains(PropertyMask::HIGHLIGHT_COLOR) {
            touched.push(NodeProperty::HighlightColor);
        }
        self.mark_all(handle, node, &touched, SyncState::PendingNativeToHost);

        let id = NodeId::from_address(node);
        let previous = self.applying_native.replace(Some(handle));
        match manager.try_borrow_mut() {
            Ok(mut host) => {
                if mask.contains(PropertyMask::FLAGS) {
                    host.set_node_flags(&id, record.node_flags(), record.node_flags_mask());
                }
                if mask.contains(PropertyMask::OPACITY) {
                    host.set_node_opacity(&id, record.opacity);
                }
                if mask.contains(PropertyMask::HIGHLIGHT_COLOR) {
                    host.set_highlight_color(&id, record.highlight_color);
                }
            }
            Err(_) => {
                warn!(handle, node, "host view-state manager busy during node update");
                self.applying_native.set(previous);
                self.mark_all(handle, node, &touched, SyncState::Unsynced);
                return;
            }
        }
        self.applying_native.set(previous);
        self.mark_all(handle, node, &touched, SyncState::Synced);
    }
}
