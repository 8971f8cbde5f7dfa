//! Layerstack CLI: renders a layer tree to a window or to PNG files.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use layerstack::output::{OffscreenOutput, OutputBackend, WindowSurface};
use layerstack::tree_watch::TreeWatcher;
use layerstack::{
    load_tree, GpuContext, ImageTextureLoader, InputSample, InputSource, Visualizer, VisualizerConfig,
};
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

/// Where rendered frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Display in a window (default)
    Window,
    /// Render offscreen and write PNG files
    Png,
}

/// Render a tree of GLSL shader layers.
#[derive(Parser, Debug)]
#[command(name = "layerstack")]
#[command(about = "Compile and render trees of GLSL shader layers")]
struct Args {
    /// Path to the YAML layer tree
    #[arg(short, long)]
    tree: PathBuf,

    /// Output width
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Output height
    #[arg(long, default_value = "720")]
    height: u32,

    /// Target frames per second
    #[arg(long, default_value = "60")]
    fps: u32,

    /// Output mode: window or png
    #[arg(long, value_enum, default_value = "window")]
    output: OutputMode,

    /// Number of frames to write in png mode
    #[arg(long, default_value = "1")]
    frames: u32,

    /// PNG file to write; numbered when more than one frame is rendered
    #[arg(long, default_value = "frame.png")]
    out: PathBuf,

    /// Recompile when the tree or its layer files change
    #[arg(long)]
    watch: bool,
}

impl Args {
    fn tree_dir(&self) -> PathBuf {
        match self.tree.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Keys that act as buttons, indexed by input id.
const BUTTON_KEYS: [KeyCode; 10] = [
    KeyCode::Digit0,
    KeyCode::Digit1,
    KeyCode::Digit2,
    KeyCode::Digit3,
    KeyCode::Digit4,
    KeyCode::Digit5,
    KeyCode::Digit6,
    KeyCode::Digit7,
    KeyCode::Digit8,
    KeyCode::Digit9,
];

/// Negative and positive keys of each axis, indexed by input id.
const AXIS_KEYS: [(KeyCode, KeyCode); 2] = [
    (KeyCode::ArrowLeft, KeyCode::ArrowRight),
    (KeyCode::ArrowDown, KeyCode::ArrowUp),
];

/// Keyboard state shared between the event loop and the visualizer.
/// Device 0 is the keyboard; other devices report idle.
#[derive(Clone, Default)]
struct KeyboardInput {
    held: Rc<RefCell<HashSet<KeyCode>>>,
}

impl KeyboardInput {
    fn set(&self, key: KeyCode, pressed: bool) {
        let mut held = self.held.borrow_mut();
        if pressed {
            held.insert(key);
        } else {
            held.remove(&key);
        }
    }

    fn is_held(&self, key: KeyCode) -> bool {
        self.held.borrow().contains(&key)
    }
}

impl InputSource for KeyboardInput {
    fn sample_button(&self, device: u32, input_id: u32) -> InputSample {
        let held = device == 0
            && BUTTON_KEYS
                .get(input_id as usize)
                .is_some_and(|key| self.is_held(*key));
        InputSample {
            value: if held { 1.0 } else { 0.0 },
            button_held: held,
            touch_held: false,
        }
    }

    fn sample_axis(&self, device: u32, input_id: u32) -> InputSample {
        let Some(&(negative, positive)) = AXIS_KEYS.get(input_id as usize).filter(|_| device == 0) else {
            return InputSample::default();
        };
        let value = f32::from(u8::from(self.is_held(positive))) - f32::from(u8::from(self.is_held(negative)));
        InputSample {
            value,
            button_held: value != 0.0,
            touch_held: false,
        }
    }
}

/// Application state for the event loop.
struct LayerstackApp {
    args: Args,
    window: Option<Arc<Window>>,
    surface: Option<WindowSurface>,
    visualizer: Option<Visualizer>,
    watcher: Option<TreeWatcher>,
    keyboard: KeyboardInput,
    last_frame_time: Instant,
    frame_duration: Duration,
    frame_count: u32,
    fps_last_time: Instant,
}

impl LayerstackApp {
    fn new(args: Args) -> Self {
        let frame_duration = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
        Self {
            args,
            window: None,
            surface: None,
            visualizer: None,
            watcher: None,
            keyboard: KeyboardInput::default(),
            last_frame_time: Instant::now(),
            frame_duration,
            frame_count: 0,
            fps_last_time: Instant::now(),
        }
    }

    fn initialize(&mut self, window: Arc<Window>) -> Result<()> {
        let (gpu, surface) = GpuContext::for_window(window.clone())?;
        let surface = WindowSurface::new(&gpu, surface, window);
        let (width, height) = surface.size();

        let config = VisualizerConfig {
            width,
            height,
            output_format: surface.format(),
        };
        let loader = ImageTextureLoader::new(self.args.tree_dir());
        let mut visualizer = Visualizer::new(gpu, config, loader)?.with_input(self.keyboard.clone());

        let tree = load_tree(&self.args.tree)?;
        visualizer.compile(&tree);

        if self.args.watch {
            self.watcher = Some(TreeWatcher::new(&self.args.tree)?);
        }
        self.surface = Some(surface);
        self.visualizer = Some(visualizer);
        Ok(())
    }

    fn process_frame(&mut self) {
        let Some(visualizer) = &mut self.visualizer else {
            return;
        };
        let Some(surface) = &mut self.surface else {
            return;
        };

        if let Some(tree) = self.watcher.as_mut().and_then(TreeWatcher::check_for_changes) {
            visualizer.compile(&tree);
        }

        self.frame_count += 1;
        let elapsed = self.fps_last_time.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            let config = visualizer.config();
            debug!("[Perf] Rendering at {:.2} FPS (Resolution: {}x{})", fps, config.width, config.height);
            self.frame_count = 0;
            self.fps_last_time = Instant::now();
        }

        if let Err(e) = surface.write_frame(visualizer) {
            error!("Render error: {e:#}");
        }
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if let Some(surface) = &mut self.surface {
            surface.resize(size);
        }
        if let Some(visualizer) = &mut self.visualizer {
            if let Err(e) = visualizer.resize(size.width, size.height) {
                debug!("keeping render targets: {e}");
            }
        }
    }
}

impl ApplicationHandler for LayerstackApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attrs = WindowAttributes::default()
            .with_title("Layerstack")
            .with_inner_size(PhysicalSize::new(self.args.width, self.args.height));

        match event_loop.create_window(window_attrs) {
            Ok(window) => {
                let window = Arc::new(window);
                self.window = Some(window.clone());
                if let Err(e) = self.initialize(window) {
                    error!("Initialization error: {e:#}");
                    event_loop.exit();
                }
            }
            Err(e) => {
                error!("Failed to create window: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => self.resize(size),
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.keyboard.set(code, event.state == ElementState::Pressed);
                }
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                if now.duration_since(self.last_frame_time) >= self.frame_duration {
                    self.process_frame();
                    self.last_frame_time = now;
                }
                if let Some(surface) = &self.surface {
                    surface.window().request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(surface) = &self.surface {
            surface.window().request_redraw();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(tree = %args.tree.display(), output = ?args.output, "starting layerstack");

    match args.output {
        OutputMode::Window => run_window_mode(args),
        OutputMode::Png => run_png_mode(args),
    }
}

/// Run in window output mode (default).
fn run_window_mode(args: Args) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = LayerstackApp::new(args);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Render a fixed number of frames offscreen, with time advancing by one
/// frame interval per frame.
fn run_png_mode(args: Args) -> Result<()> {
    let gpu = GpuContext::headless().context("failed to create headless GPU context")?;
    let config = VisualizerConfig {
        width: args.width,
        height: args.height,
        output_format: OffscreenOutput::FORMAT,
    };
    let loader = ImageTextureLoader::new(args.tree_dir());
    let mut visualizer = Visualizer::new(gpu.clone(), config, loader)?;
    let mut output = OffscreenOutput::new(&gpu, args.width, args.height);

    let tree = load_tree(&args.tree)?;
    visualizer.compile(&tree);

    let fps = f64::from(args.fps.max(1));
    for frame in 0..args.frames {
        visualizer.set_time(Some(f64::from(frame) / fps));
        output.write_frame(&mut visualizer)?;
        let path = numbered_path(&args.out, frame, args.frames);
        output.save_png(&gpu, &path)?;
        info!(path = %path.display(), "wrote frame");
    }
    Ok(())
}

/// `out` itself for a single frame, otherwise `stem_0007.ext`.
fn numbered_path(out: &Path, frame: u32, frames: u32) -> PathBuf {
    if frames <= 1 {
        return out.to_path_buf();
    }
    let stem = out.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
    let extension = out.extension().and_then(|s| s.to_str()).unwrap_or("png");
    out.with_file_name(format!("{stem}_{frame:04}.{extension}"))
}
