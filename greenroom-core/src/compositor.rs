//! Canvas compositing (host only)
//!
//! The host renders every participant feed, the AI interviewer avatar, and
//! any floating reactions into one frame, and that frame is what every
//! guest receives. Rendering is a pure function of a [`Scene`] snapshot;
//! the tick signal comes from a dedicated timer task rather than a
//! foreground frame callback, so the feed keeps its full rate while the
//! host surface is unfocused. Every tick redraws the whole frame, since
//! participant count and layout can change between any two ticks.

use crate::media::{VideoFrame, VideoTrack, BYTES_PER_PIXEL};
use bytes::Bytes;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Compositor configuration
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    /// Output frame width
    pub width: u32,
    /// Output frame height
    pub height: u32,
    /// Render tick interval
    pub tick: Duration,
    /// Sidebar width in screen-share mode
    pub sidebar_width: u32,
    /// Height of the name label bar inside a tile
    pub label_height: u32,
    /// Floating reaction lifetime
    pub reaction_ttl: Duration,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            tick: Duration::from_millis(33),
            sidebar_width: 240,
            label_height: 24,
            reaction_ttl: Duration::from_millis(2500),
        }
    }
}

/// Layout mode, recomputed from the scene every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// Uniform participant grid (the default)
    Grid,
    /// Active screen share beside a fixed-width sidebar of previews
    Screen,
    /// Active screen share cover-scaled over the whole frame
    Fullscreen,
}

/// One participant tile
#[derive(Debug, Clone)]
pub struct Tile {
    /// Display name for the label bar
    pub name: String,
    /// Latest frame from the participant's track
    pub frame: VideoFrame,
    /// Mirror horizontally (the host's own preview)
    pub mirror: bool,
}

/// A reaction positioned for rendering
#[derive(Debug, Clone)]
pub struct SceneReaction {
    /// Index into [`Scene::tiles`] the reaction is attributed to
    pub tile: usize,
    /// The emoji
    pub emoji: String,
    /// Elapsed fraction of the reaction lifetime, 0..1
    pub progress: f32,
}

/// Transient render input, rebuilt every tick and never persisted
#[derive(Debug, Clone, Default)]
pub struct Scene {
    /// Tiles in fixed order: AI avatar, host, then guests
    pub tiles: Vec<Tile>,
    /// The single active screen source, if any
    pub screen: Option<VideoFrame>,
    /// Fullscreen preference, meaningful only while a screen is active
    pub fullscreen: bool,
    /// Live reactions
    pub reactions: Vec<SceneReaction>,
}

impl Scene {
    /// The layout mode this scene renders in
    #[must_use]
    pub fn mode(&self) -> LayoutMode {
        match (&self.screen, self.fullscreen) {
            (Some(_), true) => LayoutMode::Fullscreen,
            (Some(_), false) => LayoutMode::Screen,
            (None, _) => LayoutMode::Grid,
        }
    }
}

/// A short-lived emoji reaction
#[derive(Debug, Clone)]
pub struct FloatingReaction {
    /// The emoji
    pub emoji: String,
    /// Attributed sender: a peer id, or "host" / "ai"
    pub sender: String,
    started: Instant,
}

impl FloatingReaction {
    /// Elapsed fraction of `ttl`, clamped to 0..1
    #[must_use]
    pub fn progress(&self, now: Instant, ttl: Duration) -> f32 {
        let elapsed = now.saturating_duration_since(self.started);
        (elapsed.as_secs_f32() / ttl.as_secs_f32()).clamp(0.0, 1.0)
    }
}

/// Reaction render buffer
///
/// Reactions are garbage-collected by elapsed time on every read, never
/// freed explicitly.
#[derive(Debug)]
pub struct ReactionBuffer {
    ttl: Duration,
    items: RwLock<Vec<FloatingReaction>>,
}

impl ReactionBuffer {
    /// Buffer with the given reaction lifetime
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            items: RwLock::new(Vec::new()),
        }
    }

    /// Add a reaction attributed to `sender`, starting now
    pub fn push(&self, sender: impl Into<String>, emoji: impl Into<String>) {
        self.items.write().push(FloatingReaction {
            emoji: emoji.into(),
            sender: sender.into(),
            started: Instant::now(),
        });
    }

    /// Live reactions with their progress; expired entries are pruned
    #[must_use]
    pub fn live(&self) -> Vec<(FloatingReaction, f32)> {
        let now = Instant::now();
        let mut items = self.items.write();
        items.retain(|r| r.progress(now, self.ttl) < 1.0);
        items
            .iter()
            .map(|r| (r.clone(), r.progress(now, self.ttl)))
            .collect()
    }

    /// Number of buffered reactions, including any not yet pruned
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

/// Grid side length for `n` tiles: `ceil(sqrt(n))`
#[must_use]
pub fn grid_side(n: usize) -> u32 {
    if n == 0 {
        return 1;
    }
    (n as f64).sqrt().ceil() as u32
}

/// Cubic ease-out
#[must_use]
pub fn ease_out_cubic(p: f32) -> f32 {
    let inv = 1.0 - p.clamp(0.0, 1.0);
    1.0 - inv * inv * inv
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width
    pub w: u32,
    /// Height
    pub h: u32,
}

impl Rect {
    /// Construct a rect
    #[must_use]
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

/// Largest `src`-aspect rect that fits inside `dst`, centered (letterbox)
#[must_use]
pub fn fit_rect(src_w: u32, src_h: u32, dst: Rect) -> Rect {
    if src_w == 0 || src_h == 0 || dst.w == 0 || dst.h == 0 {
        return Rect::new(dst.x, dst.y, 0, 0);
    }
    let scale = f64::min(
        f64::from(dst.w) / f64::from(src_w),
        f64::from(dst.h) / f64::from(src_h),
    );
    let w = (f64::from(src_w) * scale).round().max(1.0) as u32;
    let h = (f64::from(src_h) * scale).round().max(1.0) as u32;
    Rect::new(
        dst.x + (dst.w as i32 - w as i32) / 2,
        dst.y + (dst.h as i32 - h as i32) / 2,
        w.min(dst.w),
        h.min(dst.h),
    )
}

/// Smallest `src`-aspect rect that covers `dst`, centered (crop)
#[must_use]
pub fn cover_rect(src_w: u32, src_h: u32, dst: Rect) -> Rect {
    if src_w == 0 || src_h == 0 || dst.w == 0 || dst.h == 0 {
        return dst;
    }
    let scale = f64::max(
        f64::from(dst.w) / f64::from(src_w),
        f64::from(dst.h) / f64::from(src_h),
    );
    let w = (f64::from(src_w) * scale).round() as u32;
    let h = (f64::from(src_h) * scale).round() as u32;
    Rect::new(
        dst.x - (w as i32 - dst.w as i32) / 2,
        dst.y - (h as i32 - dst.h as i32) / 2,
        w,
        h,
    )
}

// 3x5 glyphs for label bars, one u16 per glyph: five rows of three bits,
// most significant row first, leftmost pixel in each row's high bit.
const GLYPH_W: u32 = 3;
const GLYPH_H: u32 = 5;

fn glyph_rows(c: char) -> Option<u16> {
    let bits = match c.to_ascii_uppercase() {
        'A' => 0b010_101_111_101_101,
        'B' => 0b110_101_110_101_110,
        'C' => 0b011_100_100_100_011,
        'D' => 0b110_101_101_101_110,
        'E' => 0b111_100_110_100_111,
        'F' => 0b111_100_110_100_100,
        'G' => 0b011_100_101_101_011,
        'H' => 0b101_101_111_101_101,
        'I' => 0b111_010_010_010_111,
        'J' => 0b001_001_001_101_010,
        'K' => 0b101_110_100_110_101,
        'L' => 0b100_100_100_100_111,
        'M' => 0b101_111_111_101_101,
        'N' => 0b110_101_101_101_101,
        'O' => 0b010_101_101_101_010,
        'P' => 0b110_101_110_100_100,
        'Q' => 0b010_101_101_110_011,
        'R' => 0b110_101_110_101_101,
        'S' => 0b011_100_010_001_110,
        'T' => 0b111_010_010_010_010,
        'U' => 0b101_101_101_101_111,
        'V' => 0b101_101_101_101_010,
        'W' => 0b101_101_111_111_101,
        'X' => 0b101_101_010_101_101,
        'Y' => 0b101_101_010_010_010,
        'Z' => 0b111_001_010_100_111,
        '0' => 0b111_101_101_101_111,
        '1' => 0b010_110_010_010_111,
        '2' => 0b111_001_111_100_111,
        '3' => 0b111_001_111_001_111,
        '4' => 0b101_101_111_001_001,
        '5' => 0b111_100_111_001_111,
        '6' => 0b111_100_111_101_111,
        '7' => 0b111_001_001_010_010,
        '8' => 0b111_101_111_101_111,
        '9' => 0b111_101_111_001_111,
        '-' => 0b000_000_111_000_000,
        ' ' => 0,
        _ => return None,
    };
    Some(bits)
}

/// Mutable RGBA canvas the renderer draws into
struct Canvas {
    width: u32,
    height: u32,
    buf: Vec<u8>,
}

impl Canvas {
    fn new(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut buf = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for _ in 0..(width as usize * height as usize) {
            buf.extend_from_slice(&rgba);
        }
        Self { width, height, buf }
    }

    fn put(&mut self, x: i32, y: i32, rgba: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let off = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        self.buf[off..off + 4].copy_from_slice(&rgba);
    }

    fn blend(&mut self, x: i32, y: i32, rgba: [u8; 4], alpha: f32) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let a = alpha.clamp(0.0, 1.0);
        let off = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        for i in 0..3 {
            let dst = f32::from(self.buf[off + i]);
            let src = f32::from(rgba[i]);
            self.buf[off + i] = (dst + (src - dst) * a) as u8;
        }
        self.buf[off + 3] = 255;
    }

    fn fill_rect(&mut self, rect: Rect, rgba: [u8; 4]) {
        for y in rect.y..rect.y + rect.h as i32 {
            for x in rect.x..rect.x + rect.w as i32 {
                self.put(x, y, rgba);
            }
        }
    }

    /// Nearest-neighbor blit of `frame` into `dst`, clipped to `clip`
    fn blit(&mut self, frame: &VideoFrame, dst: Rect, clip: Rect, mirror: bool) {
        if dst.w == 0 || dst.h == 0 || frame.width() == 0 || frame.height() == 0 {
            return;
        }
        let y0 = dst.y.max(clip.y).max(0);
        let y1 = (dst.y + dst.h as i32).min(clip.y + clip.h as i32).min(self.height as i32);
        let x0 = dst.x.max(clip.x).max(0);
        let x1 = (dst.x + dst.w as i32).min(clip.x + clip.w as i32).min(self.width as i32);
        for y in y0..y1 {
            let sy = ((y - dst.y) as u64 * u64::from(frame.height()) / u64::from(dst.h)) as u32;
            for x in x0..x1 {
                let fx = (x - dst.x) as u64;
                let fx = if mirror {
                    u64::from(dst.w) - 1 - fx
                } else {
                    fx
                };
                let sx = (fx * u64::from(frame.width()) / u64::from(dst.w)) as u32;
                self.put(x, y, frame.pixel(sx, sy));
            }
        }
    }

    fn draw_disc(&mut self, cx: i32, cy: i32, radius: i32, rgba: [u8; 4], alpha: f32) {
        for y in cy - radius..=cy + radius {
            for x in cx - radius..=cx + radius {
                let dx = x - cx;
                let dy = y - cy;
                if dx * dx + dy * dy <= radius * radius {
                    self.blend(x, y, rgba, alpha);
                }
            }
        }
    }

    fn draw_text(&mut self, text: &str, x: i32, y: i32, scale: u32, rgba: [u8; 4]) {
        let mut pen = x;
        for c in text.chars() {
            if let Some(bits) = glyph_rows(c) {
                for row in 0..GLYPH_H {
                    for col in 0..GLYPH_W {
                        let bit = GLYPH_W * GLYPH_H - 1 - (row * GLYPH_W + col);
                        if bits >> bit & 1 == 1 {
                            let px = pen + (col * scale) as i32;
                            let py = y + (row * scale) as i32;
                            self.fill_rect(Rect::new(px, py, scale, scale), rgba);
                        }
                    }
                }
            }
            pen += ((GLYPH_W + 1) * scale) as i32;
        }
    }

    fn into_frame(self) -> VideoFrame {
        VideoFrame::new(self.width, self.height, Bytes::from(self.buf))
            .unwrap_or_else(|_| VideoFrame::black(self.width, self.height))
    }
}

const BACKDROP: [u8; 4] = [16, 16, 20, 255];
const TILE_BACKDROP: [u8; 4] = [28, 28, 34, 255];
const LABEL_BAR: [u8; 4] = [10, 10, 12, 255];
const LABEL_TEXT: [u8; 4] = [230, 230, 230, 255];

fn reaction_color(emoji: &str) -> [u8; 4] {
    let digest = blake3::hash(emoji.as_bytes());
    let b = digest.as_bytes();
    // Keep the channel floor high so reactions stay visible on dark tiles.
    [b[0] | 0x80, b[1] | 0x80, b[2] | 0x80, 255]
}

/// A synthetic AI interviewer avatar frame: a disc pulsing with the tick
#[must_use]
pub fn avatar_frame(width: u32, height: u32, tick: u64) -> VideoFrame {
    let mut canvas = Canvas::new(width, height, [34, 30, 52, 255]);
    let cx = width as i32 / 2;
    let cy = height as i32 / 2;
    let base = (width.min(height) as i32) / 4;
    let pulse = ((tick % 60) as f32 / 60.0 * std::f32::consts::TAU).sin();
    let radius = base + (pulse * base as f32 * 0.12) as i32;
    canvas.draw_disc(cx, cy, radius + 4, [96, 82, 170, 255], 1.0);
    canvas.draw_disc(cx, cy, radius, [156, 140, 235, 255], 1.0);
    canvas.into_frame()
}

fn draw_tile(canvas: &mut Canvas, tile: &Tile, cell: Rect, config: &CompositorConfig) {
    canvas.fill_rect(cell, TILE_BACKDROP);

    let label_h = config.label_height.min(cell.h / 4);
    let video_area = Rect::new(cell.x, cell.y, cell.w, cell.h.saturating_sub(label_h));

    // Letterbox the source into a 16:9 box inside the cell.
    let box_rect = fit_rect(16, 9, video_area);
    let dst = fit_rect(tile.frame.width(), tile.frame.height(), box_rect);
    canvas.blit(&tile.frame, dst, video_area, tile.mirror);

    let bar = Rect::new(
        cell.x,
        cell.y + (cell.h - label_h) as i32,
        cell.w,
        label_h,
    );
    canvas.fill_rect(bar, LABEL_BAR);
    let scale = (label_h / (GLYPH_H + 2)).max(1);
    canvas.draw_text(
        &tile.name,
        bar.x + scale as i32 * 2,
        bar.y + (label_h as i32 - (GLYPH_H * scale) as i32) / 2,
        scale,
        LABEL_TEXT,
    );
}

fn draw_reactions(canvas: &mut Canvas, scene: &Scene, cells: &[Rect]) {
    for reaction in &scene.reactions {
        let Some(cell) = cells.get(reaction.tile) else {
            continue;
        };
        let ease = ease_out_cubic(reaction.progress);
        let rise = (cell.h as f32 * 0.6) * ease;
        let cx = cell.x + cell.w as i32 / 2;
        let cy = cell.y + cell.h as i32 - (cell.h as i32 / 5) - rise as i32;
        let radius = (cell.w.min(cell.h) as i32 / 12).max(3);
        let alpha = 1.0 - ease;
        canvas.draw_disc(cx, cy, radius, reaction_color(&reaction.emoji), alpha);
    }
}

fn render_grid(canvas: &mut Canvas, scene: &Scene, config: &CompositorConfig) -> Vec<Rect> {
    let n = scene.tiles.len().max(1);
    let side = grid_side(n);
    let cell_w = config.width / side;
    let cell_h = config.height / side;

    let mut cells = Vec::with_capacity(n);
    for (i, tile) in scene.tiles.iter().enumerate() {
        let col = (i as u32) % side;
        let row = (i as u32) / side;
        let cell = Rect::new((col * cell_w) as i32, (row * cell_h) as i32, cell_w, cell_h);
        draw_tile(canvas, tile, cell, config);
        cells.push(cell);
    }
    cells
}

fn render_screen(canvas: &mut Canvas, scene: &Scene, config: &CompositorConfig) {
    let Some(screen) = &scene.screen else {
        return;
    };
    let sidebar_w = config.sidebar_width.min(config.width / 3);
    let content = Rect::new(0, 0, config.width - sidebar_w, config.height);
    let dst = fit_rect(screen.width(), screen.height(), content);
    canvas.blit(screen, dst, content, false);

    // Fixed-width sidebar of preview tiles, stacked top to bottom.
    let sidebar = Rect::new(content.w as i32, 0, sidebar_w, config.height);
    canvas.fill_rect(sidebar, BACKDROP);
    let tile_h = sidebar_w * 9 / 16 + config.label_height;
    let pad = 6u32;
    let mut y = sidebar.y + pad as i32;
    for tile in &scene.tiles {
        if y + tile_h as i32 > config.height as i32 {
            break;
        }
        let cell = Rect::new(
            sidebar.x + pad as i32,
            y,
            sidebar_w - pad * 2,
            tile_h,
        );
        draw_tile(canvas, tile, cell, config);
        y += (tile_h + pad) as i32;
    }
}

fn render_fullscreen(canvas: &mut Canvas, scene: &Scene, config: &CompositorConfig) {
    let Some(screen) = &scene.screen else {
        return;
    };
    let full = Rect::new(0, 0, config.width, config.height);
    let dst = cover_rect(screen.width(), screen.height(), full);
    canvas.blit(screen, dst, full, false);
}

/// Render one composite frame from a scene snapshot
///
/// Pure: equal scenes render equal frames.
#[must_use]
pub fn render(scene: &Scene, config: &CompositorConfig) -> VideoFrame {
    let mut canvas = Canvas::new(config.width, config.height, BACKDROP);
    match scene.mode() {
        LayoutMode::Grid => {
            let cells = render_grid(&mut canvas, scene, config);
            draw_reactions(&mut canvas, scene, &cells);
        }
        LayoutMode::Screen => render_screen(&mut canvas, scene, config),
        LayoutMode::Fullscreen => render_fullscreen(&mut canvas, scene, config),
    }
    canvas.into_frame()
}

/// Handle on a running compositor; dropping it does not stop the loops
#[derive(Debug)]
pub struct CompositorHandle {
    shutdown: watch::Sender<bool>,
}

impl CompositorHandle {
    /// Stop the ticker and render loops
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The host-side compositor
///
/// Owns the composite output track and the reaction buffer. [`Self::start`]
/// spawns two tasks: an isolated ticker whose only job is posting
/// fixed-interval signals, and a render loop that snapshots the scene and
/// redraws the output track. The render loop is the sole writer of the
/// composite; the ticker touches no shared state.
pub struct Compositor {
    config: CompositorConfig,
    output: VideoTrack,
    reactions: std::sync::Arc<ReactionBuffer>,
}

impl Compositor {
    /// Create a compositor; the output track starts black
    #[must_use]
    pub fn new(config: CompositorConfig) -> Self {
        let output = VideoTrack::new(
            "composite",
            VideoFrame::black(config.width, config.height),
        );
        let reactions = std::sync::Arc::new(ReactionBuffer::new(config.reaction_ttl));
        Self {
            config,
            output,
            reactions,
        }
    }

    /// The composite output track; clones observe every rendered frame
    #[must_use]
    pub fn output_track(&self) -> VideoTrack {
        self.output.clone()
    }

    /// The shared reaction buffer
    #[must_use]
    pub fn reactions(&self) -> std::sync::Arc<ReactionBuffer> {
        self.reactions.clone()
    }

    /// Compositor configuration
    #[must_use]
    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Start rendering; `build_scene` is called once per tick
    pub fn start<F>(&self, mut build_scene: F) -> CompositorHandle
    where
        F: FnMut(u64) -> Scene + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tick_tx, mut tick_rx) = mpsc::channel::<u64>(1);

        // Timer task: nothing but the clock lives here.
        let tick = self.config.tick;
        let mut ticker_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker_shutdown.changed() => {
                        if *ticker_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if tick_tx.send(n).await.is_err() {
                            break;
                        }
                        n += 1;
                    }
                }
            }
        });

        // Render loop: sole writer of the output track.
        let config = self.config.clone();
        let output = self.output.clone();
        let mut render_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = render_shutdown.changed() => {
                        if *render_shutdown.borrow() {
                            tracing::debug!("compositor stopped");
                            break;
                        }
                    }
                    tick = tick_rx.recv() => {
                        let Some(n) = tick else { break };
                        let scene = build_scene(n);
                        output.push_frame(render(&scene, &config));
                    }
                }
            }
        });

        CompositorHandle {
            shutdown: shutdown_tx,
        }
    }
}
