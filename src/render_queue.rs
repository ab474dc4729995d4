//! Per-renderer command queues and the cooperative render loop.
//!
//! Commands queued for a renderer run in FIFO order exactly once, right before that
//! renderer's next frame. State lives behind a `RefCell` so commands may queue further work
//! or stop the loop while a tick is in progress.

use crate::native::check_status;
use crate::registry::ResourceRegistry;
use crate::token::RendererToken;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use tracing::{debug, warn};

pub type PendingCommand = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub ticks: u64,
    pub frames_rendered: u64,
    pub commands_run: u64,
}

#[derive(Default)]
struct RendererQueue {
    commands: VecDeque<PendingCommand>,
    state: LoopState,
    stats: FrameStats,
}

#[derive(Default)]
pub struct RenderCommandQueue {
    queues: RefCell<BTreeMap<RendererToken, RendererQueue>>,
}

impl RenderCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `command` for the renderer's next frame. Commands queued while the loop is
    /// idle wait for the next start.
    pub fn queue_command(&self, renderer: RendererToken, command: impl FnOnce() + 'static) {
        self.queues.borrow_mut().entry(renderer).or_default().commands.push_back(Box::new(command));
    }

    pub fn start_render_loop(&self, renderer: RendererToken) {
        let mut queues = self.queues.borrow_mut();
        let queue = queues.entry(renderer).or_default();
        if queue.state == LoopState::Idle {
            queue.state = LoopState::Scheduled;
            debug!(renderer = %renderer, "render loop scheduled");
        }
    }

    /// Stops the loop at once. A frame already in flight completes but is not re-armed.
    pub fn stop_render_loop(&self, renderer: RendererToken) {
        if let Some(queue) = self.queues.borrow_mut().get_mut(&renderer) {
            queue.state = LoopState::Idle;
        }
    }

    pub fn state(&self, renderer: RendererToken) -> LoopState {
        self.queues.borrow().get(&renderer).map(|queue| queue.state).unwrap_or_default()
    }

    pub fn stats(&self, renderer: RendererToken) -> FrameStats {
        self.queues.borrow().get(&renderer).map(|queue| queue.stats).unwrap_or_default()
    }

    pub fn pending(&self, renderer: RendererToken) -> usize {
        self.queues.borrow().get(&renderer).map_or(0, |queue| queue.commands.len())
    }

    /// Drops the renderer's queue, loop state and stats without running anything.
    pub fn discard(&self, renderer: RendererToken) -> usize {
        let removed = self.queues.borrow_mut().remove(&renderer);
        removed.map_or(0, |queue| queue.commands.len())
    }

    /// Runs one frame for every scheduled renderer and returns how many frames were
    /// rendered.
    pub fn tick(&self, registry: &ResourceRegistry) -> usize {
        let scheduled: Vec<RendererToken> = self
            .queues
            .borrow()
            .iter()
            .filter(|(_, queue)| queue.state == LoopState::Scheduled)
            .map(|(renderer, _)| *renderer)
            .collect();

        let mut rendered = 0;
        for renderer in scheduled {
            if !registry.is_live(renderer.token()) {
                warn!(renderer = %renderer, "render loop stopped for a released renderer");
                self.discard(renderer);
                continue;
            }
            if self.run_frame(registry, renderer) {
                rendered += 1;
            }
        }
        rendered
    }

    fn run_frame(&self, registry: &ResourceRegistry, renderer: RendererToken) -> bool {
        let commands = {
            let mut queues = self.queues.borrow_mut();
            let Some(queue) = queues.get_mut(&renderer) else {
                return false;
            };
            // An earlier renderer's command may have stopped this one during the same tick.
            if queue.state != LoopState::Scheduled {
                return false;
            }
            queue.state = LoopState::Running;
            mem::take(&mut queue.commands)
        };
        let executed = commands.len() as u64;
        for command in commands {
            command();
        }

        let engine = registry.engine();
        let rendered = match check_status(engine.should_render_frame(renderer.address())) {
            Ok(0) => false,
            Ok(_) => match check_status(engine.render_frame(renderer.address())) {
                Ok(_) => true,
                Err(err) => {
                    warn!(renderer = %renderer, %err, "frame render failed");
                    false
                }
            },
            Err(err) => {
                warn!(renderer = %renderer, %err, "frame check failed");
                false
            }
        };

        if let Some(queue) = self.queues.borrow_mut().get_mut(&renderer) {
            queue.stats.ticks += 1;
            queue.stats.commands_run += executed;
            if rendered {
                queue.stats.frames_rendered += 1;
            }
            if queue.state == LoopState::Running {
                queue.state = LoopState::Scheduled;
            }
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockEngine;
    use crate::sync_bridge::ViewStateSyncBridge;
    use crate::vfs::MemoryFileSystem;
    use std::rc::Rc;

    fn setup() -> (Rc<MockEngine>, ResourceRegistry, RendererToken) {
        let files = Rc::new(MemoryFileSystem::new("/vfs"));
        let engine = Rc::new(MockEngine::new(files.clone()));
        let mut registry = ResourceRegistry::new(engine.clone(), files);
        let instance = registry.create_engine_instance("client").expect("instance");
        let renderer = registry.create_renderer(instance).expect("renderer");
        (engine, registry, renderer)
    }

    #[test]
    fn commands_drain_in_order_before_the_frame() {
        let (engine, registry, renderer) = setup();
        let queue = RenderCommandQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3 {
            let log = log.clone();
            let engine = engine.clone();
            queue.queue_command(renderer, move || {
                log.borrow_mut().push((id, engine.frames_rendered(renderer.address())));
            });
        }
        assert_eq!(queue.tick(&registry), 0);
        assert_eq!(queue.pending(renderer), 3);

        queue.start_render_loop(renderer);
        assert_eq!(queue.tick(&registry), 1);
        assert_eq!(*log.borrow(), vec![(0, 0), (1, 0), (2, 0)]);
        assert_eq!(engine.frames_rendered(renderer.address()), 1);
        assert_eq!(queue.state(renderer), LoopState::Scheduled);
        assert_eq!(queue.stats(renderer), FrameStats { ticks: 1, frames_rendered: 1, commands_run: 3 });
    }

    #[test]
    fn skipped_frames_still_drain_commands() {
        let (engine, registry, renderer) = setup();
        let queue = RenderCommandQueue::new();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        queue.queue_command(renderer, move || *flag.borrow_mut() = true);
        queue.start_render_loop(renderer);
        engine.set_should_render(false);
        assert_eq!(queue.tick(&registry), 0);
        assert!(*ran.borrow());
        assert_eq!(engine.frames_rendered(renderer.address()), 0);
    }

    #[test]
    fn stopping_mid_frame_prevents_the_next_one() {
        let (engine, registry, renderer) = setup();
        let queue = Rc::new(RenderCommandQueue::new());
        queue.start_render_loop(renderer);
        let handle = queue.clone();
        queue.queue_command(renderer, move || handle.stop_render_loop(renderer));
        assert_eq!(queue.tick(&registry), 1);
        assert_eq!(queue.state(renderer), LoopState::Idle);
        assert_eq!(queue.tick(&registry), 0);
        assert_eq!(engine.frames_rendered(renderer.address()), 1);
    }

    #[test]
    fn renderers_stopped_earlier_in_the_tick_do_not_render() {
        let (engine, mut registry, first) = setup();
        let instance = registry.engine_instances()[0];
        let second = registry.create_renderer(instance).expect("second renderer");
        let queue = Rc::new(RenderCommandQueue::new());
        queue.start_render_loop(first);
        queue.start_render_loop(second);
        let handle = queue.clone();
        queue.queue_command(first, move || handle.stop_render_loop(second));
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        queue.queue_command(second, move || *flag.borrow_mut() = true);

        assert_eq!(queue.tick(&registry), 1);
        assert_eq!(engine.frames_rendered(first.address()), 1);
        assert_eq!(engine.frames_rendered(second.address()), 0);
        assert!(!*ran.borrow(), "commands of a stopped renderer wait for the next start");
        assert_eq!(queue.state(second), LoopState::Idle);
        assert_eq!(queue.pending(second), 1);
    }

    #[test]
    fn released_renderers_fall_out_of_the_loop() {
        let (engine, mut registry, renderer) = setup();
        let bridge = ViewStateSyncBridge::new(engine.clone());
        let queue = RenderCommandQueue::new();
        queue.queue_command(renderer, || panic!("must not run for a released renderer"));
        queue.start_render_loop(renderer);
        registry.delete_renderer(renderer, &bridge).expect("delete");
        assert_eq!(queue.tick(&registry), 0);
        assert_eq!(queue.state(renderer), LoopState::Idle);
        assert_eq!(queue.pending(renderer), 0);
    }
}
