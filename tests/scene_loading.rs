use pollster::block_on;
use std::rc::Rc;
use viewer_bridge::native::mock::MockEngine;
use viewer_bridge::native::NativeError;
use viewer_bridge::registry::{RegistryError, ResourceRegistry};
use viewer_bridge::token::TokenKind;
use viewer_bridge::vfs::{MemoryFileSystem, VfsError, VirtualFileSystem};

fn fixture() -> (Rc<MockEngine>, ResourceRegistry) {
    let files = Rc::new(MemoryFileSystem::new("/vfs"));
    let engine = Rc::new(MockEngine::new(files.clone()));
    let registry = ResourceRegistry::new(engine.clone(), files);
    (engine, registry)
}

#[test]
fn async_loads_resolve_after_the_engine_completes_them() {
    let (engine, mut registry) = fixture();
    let instance = registry.create_engine_instance("loader").expect("instance");
    engine.files().write("/vfs/first.vds", b"first").expect("stage first");
    engine.files().write("/vfs/second.vds", b"second").expect("stage second");

    let first = registry.load_scene_async(instance, "/vfs/first.vds", None).expect("start first");
    let second = registry.load_scene_async(instance, "/vfs/second.vds", None).expect("start second");
    assert_eq!(first.path(), "/vfs/first.vds");
    assert_eq!(engine.pending_load_count(), 2);
    assert_eq!(registry.live_count(TokenKind::Scene), 0, "nothing is issued before completion");

    engine.complete_pending_loads();
    let first = block_on(registry.complete_scene_load(first)).expect("first scene");
    let second = block_on(registry.complete_scene_load(second)).expect("second scene");
    assert!(first.address() < second.address(), "loads complete in submission order");
    assert_eq!(registry.scene_source(first), Some("/vfs/first.vds"));
    assert_eq!(registry.scene_ref_count(second), Some(1));
}

#[test]
fn async_failures_arrive_through_the_completion() {
    let (engine, mut registry) = fixture();
    let instance = registry.create_engine_instance("loader").expect("instance");
    engine.files().write("/vfs/locked.vds", b"locked:secret\nbody").expect("stage");

    let missing = registry.load_scene_async(instance, "/vfs/missing.vds", None).expect("start missing");
    let locked = registry.load_scene_async(instance, "/vfs/locked.vds", Some("guess")).expect("start locked");
    engine.complete_pending_loads();

    let err = block_on(registry.complete_scene_load(missing)).unwrap_err();
    assert_eq!(err, RegistryError::Native(NativeError::FileNotFound));
    let err = block_on(registry.complete_scene_load(locked)).unwrap_err();
    assert_eq!(err, RegistryError::Native(NativeError::WrongPassword));
    assert_eq!(registry.live_count(TokenKind::Scene), 0);
}

#[test]
fn refused_loads_fail_immediately() {
    let (engine, mut registry) = fixture();
    let instance = registry.create_engine_instance("loader").expect("instance");
    let err = registry.load_scene_async(instance, "", None).unwrap_err();
    assert_eq!(err, RegistryError::Native(NativeError::BadArgument));
    assert_eq!(engine.pending_load_count(), 0);
}

#[test]
fn auto_completing_engines_resolve_without_a_pump() {
    let (engine, mut registry) = fixture();
    let instance = registry.create_engine_instance("loader").expect("instance");
    engine.set_auto_complete_loads(true);
    engine.files().write("/vfs/ready.vds", b"ready").expect("stage");

    let pending = registry.load_scene_async(instance, "/vfs/ready.vds", None).expect("start");
    let scene = block_on(registry.complete_scene_load(pending)).expect("scene");
    assert!(registry.is_live(scene.token()));
}

#[test]
fn staged_bytes_must_stay_inside_the_sandbox() {
    let (engine, mut registry) = fixture();
    let instance = registry.create_engine_instance("loader").expect("instance");
    let err = registry.load_scene_bytes(instance, "../escape.vds", b"bytes", None).unwrap_err();
    assert_eq!(err, RegistryError::Vfs(VfsError::OutsideRoot("../escape.vds".to_string())));
    assert!(engine.files().is_empty());

    let scene = registry.load_scene_bytes(instance, "nested/model.vds", b"bytes", None).expect("nested load");
    assert_eq!(registry.scene_source(scene), Some("/vfs/nested/model.vds"));
    assert!(engine.files().is_empty(), "staged copy is removed after loading");

    let err = registry.load_scene_bytes(instance, "empty.vds", b"", None).unwrap_err();
    assert_eq!(err, RegistryError::Native(NativeError::BadFormat));
    assert!(engine.files().is_empty());
}
