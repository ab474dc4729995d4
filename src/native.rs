//! Call-style boundary of the opaque native rendering engine.
//!
//! Every entry point takes and returns primitives: addresses are `u64`, results are `i64`
//! where negative values are error codes and non-negative values carry a handle, a count or
//! a status. Nothing on this side knows how the engine lays out its objects.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use std::rc::Weak;
use thiserror::Error;

pub mod dynamic;
pub mod mock;

/// Address of an object living in engine memory. Zero is never a valid address.
pub type NativeAddr = u64;

/// Status returned when an asynchronous scene load was accepted; the result arrives later
/// through the completion callback.
pub const STATUS_LOAD_STARTED: i64 = 1;
pub const STATUS_OK: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NativeError {
    #[error("native call failed")]
    Fail,
    #[error("engine is not initialized")]
    NotInitialized,
    #[error("bad argument passed to native call")]
    BadArgument,
    #[error("engine ran out of memory")]
    OutOfMemory,
    #[error("file not found")]
    FileNotFound,
    #[error("scene is encrypted and the password is missing or wrong")]
    WrongPassword,
    #[error("unsupported or corrupt file format")]
    BadFormat,
    #[error("native object not found")]
    NotFound,
    #[error("native object is still referenced")]
    InUse,
    #[error("unknown native result code {0}")]
    Unknown(i64),
}

impl NativeError {
    pub fn from_code(code: i64) -> Self {
        match code {
            -1 => NativeError::Fail,
            -2 => NativeError::NotInitialized,
            -3 => NativeError::BadArgument,
            -4 => NativeError::OutOfMemory,
            -5 => NativeError::FileNotFound,
            -6 => NativeError::WrongPassword,
            -7 => NativeError::BadFormat,
            -8 => NativeError::NotFound,
            -9 => NativeError::InUse,
            other => NativeError::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            NativeError::Fail => -1,
            NativeError::NotInitialized => -2,
            NativeError::BadArgument => -3,
            NativeError::OutOfMemory => -4,
            NativeError::FileNotFound => -5,
            NativeError::WrongPassword => -6,
            NativeError::BadFormat => -7,
            NativeError::NotFound => -8,
            NativeError::InUse => -9,
            NativeError::Unknown(code) => code,
        }
    }
}

/// Interprets a result that must carry a handle. Negative codes win over anything else; a
/// zero result is not a handle either.
pub fn check_handle(code: i64) -> Result<NativeAddr, NativeError> {
    match code {
        c if c < 0 => Err(NativeError::from_code(c)),
        0 => Err(NativeError::Fail),
        c => Ok(c as NativeAddr),
    }
}

pub fn check_status(code: i64) -> Result<i64, NativeError> {
    if code < 0 {
        Err(NativeError::from_code(code))
    } else {
        Ok(code)
    }
}

bitflags! {
    /// Per-node state flags shared by the host managers and the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u32 {
        const VISIBLE = 0x1;
        const SELECTED = 0x2;
        const HIGHLIGHTED = 0x4;
        const CLOSED = 0x8;
    }
}

bitflags! {
    /// Which fields of a [`PropertyRecord`] are requested or valid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PropertyMask: u32 {
        const FLAGS = 0x1;
        const OPACITY = 0x2;
        const HIGHLIGHT_COLOR = 0x4;
    }
}

/// Fixed-layout node state record exchanged with the engine.
///
/// On a query `mask` holds the requested fields and `flags_mask` the requested flag bits;
/// the response overwrites `mask` with the fields actually filled in.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct PropertyRecord {
    pub mask: u32,
    pub flags: u32,
    pub flags_mask: u32,
    pub opacity: f32,
    pub highlight_color: u32,
}

impl PropertyRecord {
    pub const SIZE: usize = std::mem::size_of::<PropertyRecord>();

    pub fn request(mask: PropertyMask, flags_mask: NodeFlags) -> Self {
        Self { mask: mask.bits(), flags_mask: flags_mask.bits(), ..Self::default() }
    }

    pub fn property_mask(&self) -> PropertyMask {
        PropertyMask::from_bits_truncate(self.mask)
    }

    pub fn node_flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags)
    }

    pub fn node_flags_mask(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags_mask)
    }

    pub fn with_flags(mut self, flags: NodeFlags, flags_mask: NodeFlags) -> Self {
        self.mask |= PropertyMask::FLAGS.bits();
        self.flags = flags.bits();
        self.flags_mask = flags_mask.bits();
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.mask |= PropertyMask::OPACITY.bits();
        self.opacity = opacity;
        self
    }

    pub fn with_highlight_color(mut self, color: u32) -> Self {
        self.mask |= PropertyMask::HIGHLIGHT_COLOR.bits();
        self.highlight_color = color;
        self
    }
}

/// Host-side answers to the engine's node-state callbacks.
///
/// The engine blocks on these calls, so they are plain request/response functions.
pub trait NodeStateProvider {
    fn get_node_state(&self, view_state: NativeAddr, node: NativeAddr, record: &mut PropertyRecord);
    fn set_node_state(&self, view_state: NativeAddr, node: NativeAddr, record: &PropertyRecord);
}

/// Callback invoked once with the raw result of an asynchronous scene load.
pub type LoadCompletion = Box<dyn FnOnce(i64)>;

/// The native engine entry points used by the bridge.
///
/// Implementations must not call back into host view-state managers from the `fire_*`
/// entry points; node state is pulled through [`NodeStateProvider`] instead.
/// `attach_scene` and `delete_renderer` leave scene reference counts alone, the registry
/// retains and releases explicitly.
pub trait NativeEngine {
    fn create_instance(&self, client_id: &str) -> i64;
    fn destroy_instance(&self, instance: NativeAddr) -> i64;

    fn create_scene(&self, instance: NativeAddr) -> i64;
    fn load_scene(&self, instance: NativeAddr, path: &str, password: Option<&str>) -> i64;
    /// Returns [`STATUS_LOAD_STARTED`] when `on_complete` will be called later, or a negative
    /// code when the load was refused up front (the callback is then dropped uncalled).
    fn begin_scene_load(
        &self,
        instance: NativeAddr,
        path: &str,
        password: Option<&str>,
        on_complete: LoadCompletion,
    ) -> i64;
    /// Returns the new native reference count.
    fn retain_scene(&self, scene: NativeAddr) -> i64;
    /// Returns the remaining native reference count; the scene is destroyed at zero.
    fn release_scene(&self, scene: NativeAddr) -> i64;

    fn create_renderer(&self, instance: NativeAddr) -> i64;
    fn delete_renderer(&self, renderer: NativeAddr) -> i64;
    fn attach_scene(&self, renderer: NativeAddr, scene: Option<NativeAddr>) -> i64;
    fn should_render_frame(&self, renderer: NativeAddr) -> i64;
    fn render_frame(&self, renderer: NativeAddr) -> i64;

    fn create_camera(&self, scene: NativeAddr) -> i64;
    fn delete_camera(&self, camera: NativeAddr) -> i64;
    fn activate_camera(&self, renderer: NativeAddr, camera: Option<NativeAddr>) -> i64;
    fn create_material(&self, instance: NativeAddr) -> i64;
    fn delete_material(&self, material: NativeAddr) -> i64;

    fn create_view_state_manager(&self) -> i64;
    fn destroy_view_state_manager(&self, view_state: NativeAddr) -> i64;
    fn bind_view_state_manager(&self, renderer: NativeAddr, view_state: Option<NativeAddr>) -> i64;
    fn set_node_state_provider(&self, provider: Weak<dyn NodeStateProvider>);

    fn fire_node_visibility_changed(&self, view_state: NativeAddr, node: NativeAddr, visible: bool) -> i64;
    fn fire_node_selection_changed(&self, view_state: NativeAddr, node: NativeAddr, selected: bool) -> i64;
    fn fire_node_opacity_changed(&self, view_state: NativeAddr, node: NativeAddr, opacity: f32) -> i64;
    fn fire_node_highlight_color_changed(&self, view_state: NativeAddr, node: NativeAddr, color: u32) -> i64;

    /// Returns zero when the allocation failed.
    fn malloc(&self, size: usize) -> NativeAddr;
    fn free(&self, addr: NativeAddr);
    fn write_memory(&self, addr: NativeAddr, bytes: &[u8]) -> i64;
    fn read_memory(&self, addr: NativeAddr, out: &mut [u8]) -> i64;

    fn create_texture(&self, pixels: NativeAddr, width: u32, height: u32) -> i64;
    fn update_texture(&self, texture: NativeAddr, pixels: NativeAddr, width: u32, height: u32) -> i64;
    fn delete_texture(&self, texture: NativeAddr) -> i64;
}

/// A transient engine allocation that is freed when dropped, on success and error paths alike.
pub struct NativeAllocation<'a> {
    engine: &'a dyn NativeEngine,
    addr: NativeAddr,
    len: usize,
}

impl<'a> NativeAllocation<'a> {
    pub fn new(engine: &'a dyn NativeEngine, len: usize) -> Result<Self, NativeError> {
        let addr = engine.malloc(len);
        if addr == 0 {
            return Err(NativeError::OutOfMemory);
        }
        Ok(Self { engine, addr, len })
    }

    pub fn addr(&self) -> NativeAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), NativeError> {
        if bytes.len() > self.len {
            return Err(NativeError::BadArgument);
        }
        check_status(self.engine.write_memory(self.addr, bytes)).map(|_| ())
    }
}

impl Drop for NativeAllocation<'_> {
    fn drop(&mut self) {
        self.engine.free(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_codes_are_authoritative() {
        assert_eq!(check_handle(-5), Err(NativeError::FileNotFound));
        assert_eq!(check_handle(0), Err(NativeError::Fail));
        assert_eq!(check_handle(0x1000), Ok(0x1000));
        assert_eq!(check_status(STATUS_LOAD_STARTED), Ok(STATUS_LOAD_STARTED));
        assert_eq!(NativeError::from_code(-42), NativeError::Unknown(-42));
        assert_eq!(NativeError::Unknown(-42).code(), -42);
    }

    #[test]
    fn property_record_has_fixed_layout() {
        assert_eq!(PropertyRecord::SIZE, 20);
        let record = PropertyRecord::default()
            .with_flags(NodeFlags::VISIBLE, NodeFlags::VISIBLE | NodeFlags::SELECTED)
            .with_highlight_color(0xff00_00ff);
        let bytes = bytemuck::bytes_of(&record);
        assert_eq!(&bytes[0..4], &(PropertyMask::FLAGS | PropertyMask::HIGHLIGHT_COLOR).bits().to_le_bytes());
        assert_eq!(&bytes[16..20], &0xff00_00ffu32.to_le_bytes());
        let restored: PropertyRecord = *bytemuck::from_bytes(bytes);
        assert_eq!(restored, record);
    }
}
