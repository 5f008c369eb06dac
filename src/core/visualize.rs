//! Rendering of activated units: the input, a grid of the activated units'
//! incoming weights, and per-unit input x weight overlays.
//!
//! Signed images use a blue-white-red scale centered at zero so that
//! excitatory and inhibitory weights stay distinguishable. Multi-channel
//! weight grids are min-max normalized and drawn as RGB.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use plotters::coord::Shift;
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::ImageShape;
use crate::error::{HebbError, Result};
use crate::select::{select, ActivationSelection, DEFAULT_CUTOFF};

/// Units whose Σ|w|³ reaches this are dropped from the weight grid.
pub const FILTER_THRESHOLD: f32 = 1.1;
/// Zero padding between grid tiles, in image pixels.
pub const GRID_PADDING: usize = 2;

const COLORBAR_PX: u32 = 90;
const TITLE_FONT: (&str, f64) = ("sans-serif", 18.0);
const TICK_FONT: (&str, f64) = ("sans-serif", 13.0);

type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

fn render_err<E: std::fmt::Display>(e: E) -> HebbError {
    HebbError::Render(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// Layer whose output decides which units are active.
    pub hook_layer: String,
    /// Layer whose incoming weights are drawn.
    pub weight_layer: String,
    pub cutoff: f32,
    /// `None` disables the cubic-energy filter.
    pub filter_threshold: Option<f32>,
    /// Titles, captions and tick labels. Off unless built with `fonts`.
    pub annotate: bool,
    /// Longest side of the weight grid image, in screen pixels.
    pub target_px: u32,
    /// Screen pixels per image pixel for input and overlay panels.
    pub panel_scale: u32,
    pub out_dir: PathBuf,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            hook_layer: "repu".to_string(),
            weight_layer: "linear1".to_string(),
            cutoff: DEFAULT_CUTOFF,
            filter_threshold: Some(FILTER_THRESHOLD),
            annotate: cfg!(feature = "fonts"),
            target_px: 900,
            panel_scale: 8,
            out_dir: PathBuf::from("visualizations"),
        }
    }
}

impl VisualizerConfig {
    pub fn with_out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = dir.into();
        self
    }

    pub fn with_annotate(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    pub fn with_filter_threshold(mut self, threshold: Option<f32>) -> Self {
        self.filter_threshold = threshold;
        self
    }
}

// ---------------------------------------------------------------------------
// Weight slices

/// Σ|w|³ over one unit's weights.
pub fn cubic_energy(unit: ArrayView1<'_, f32>) -> f32 {
    unit.iter().map(|w| w.abs().powi(3)).sum()
}

/// Incoming weights of selected units, one flattened image per row. Unit
/// indices and activations stay aligned with the rows.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSlice {
    pub shape: ImageShape,
    pub units: Vec<usize>,
    pub activations: Vec<f32>,
    pub rows: Array2<f32>,
}

impl WeightSlice {
    /// Picks the rows of `weights` (`[units, C*H*W]`) named by `selection`.
    pub fn select(
        weights: ArrayView2<'_, f32>,
        shape: ImageShape,
        selection: &ActivationSelection,
    ) -> Result<Self> {
        if weights.ncols() != shape.numel() {
            return Err(HebbError::shape(format!(
                "weight rows have {} values, cannot view them as {}x{}x{}",
                weights.ncols(),
                shape.channels,
                shape.height,
                shape.width
            )));
        }
        if let Some(&bad) = selection.indices.iter().find(|&&i| i >= weights.nrows()) {
            return Err(HebbError::shape(format!(
                "unit {bad} out of range for {} units",
                weights.nrows()
            )));
        }
        Ok(Self {
            shape,
            units: selection.indices.clone(),
            activations: selection.values.clone(),
            rows: weights.select(Axis(0), &selection.indices),
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Keeps units with Σ|w|³ strictly below `threshold`.
    pub fn filter_energy(self, threshold: f32) -> Self {
        let keep: Vec<usize> = self
            .rows
            .axis_iter(Axis(0))
            .enumerate()
            .filter(|(_, row)| cubic_energy(row.view()) < threshold)
            .map(|(i, _)| i)
            .collect();
        Self {
            shape: self.shape,
            units: keep.iter().map(|&i| self.units[i]).collect(),
            activations: keep.iter().map(|&i| self.activations[i]).collect(),
            rows: self.rows.select(Axis(0), &keep),
        }
    }

    /// Row `i` as a `[C, H, W]` image.
    pub fn image(&self, i: usize) -> Result<ArrayView3<'_, f32>> {
        let shape = self.shape;
        Ok(self
            .rows
            .row(i)
            .into_shape_with_order((shape.channels, shape.height, shape.width))?)
    }
}

/// `ceil(sqrt(n))`, at least 1.
pub fn grid_columns(n: usize) -> usize {
    let mut c = (n as f64).sqrt().ceil() as usize;
    // Guard float rounding on perfect squares.
    while c > 1 && (c - 1) * (c - 1) >= n {
        c -= 1;
    }
    c.max(1)
}

/// Tiles the slice into a `[C, rows*(H+p)+p, cols*(W+p)+p]` image with zero
/// padding `p` around and between tiles.
pub fn make_grid(slice: &WeightSlice, columns: usize, padding: usize) -> Result<Array3<f32>> {
    if slice.is_empty() {
        return Err(HebbError::EmptySelection("weight grid has no units".into()));
    }
    let shape = slice.shape;
    let xmaps = columns.clamp(1, slice.len());
    let ymaps = slice.len().div_ceil(xmaps);
    let (th, tw) = (shape.height + padding, shape.width + padding);
    let mut grid = Array3::<f32>::zeros((shape.channels, ymaps * th + padding, xmaps * tw + padding));
    for i in 0..slice.len() {
        let (gy, gx) = (i / xmaps, i % xmaps);
        let y0 = gy * th + padding;
        let x0 = gx * tw + padding;
        grid.slice_mut(s![.., y0..y0 + shape.height, x0..x0 + shape.width])
            .assign(&slice.image(i)?);
    }
    Ok(grid)
}

// ---------------------------------------------------------------------------
// Colors

/// matplotlib's `bwr`: blue at -bound, white at 0, red at +bound.
pub fn diverging_color(v: f32, bound: f32) -> RGBColor {
    let t = if bound > 0.0 && v.is_finite() {
        ((v / bound + 1.0) * 0.5).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let lerp = |a: f32| (a * 255.0).round() as u8;
    if t < 0.5 {
        let u = t * 2.0;
        RGBColor(lerp(u), lerp(u), 255)
    } else {
        let u = (1.0 - t) * 2.0;
        RGBColor(255, lerp(u), lerp(u))
    }
}

fn max_abs<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    values.into_iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

fn min_max<'a>(values: impl IntoIterator<Item = &'a f32>) -> (f32, f32) {
    values
        .into_iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

// ---------------------------------------------------------------------------
// Drawing primitives

/// Nearest-neighbour fit of `[H, W]` into `area`, keeping aspect ratio.
fn draw_heatmap(area: &Area<'_>, image: ArrayView2<'_, f32>, bound: f32) -> Result<()> {
    let (h, w) = image.dim();
    draw_scaled(area, (h, w), |y, x| diverging_color(image[[y, x]], bound))
}

fn draw_rgb(area: &Area<'_>, image: ArrayView3<'_, f32>) -> Result<()> {
    let (c, h, w) = image.dim();
    draw_scaled(area, (h, w), |y, x| {
        let ch = |k: usize| {
            if k < c {
                (image[[k, y, x]].clamp(0.0, 1.0) * 255.0).round() as u8
            } else {
                0
            }
        };
        RGBColor(ch(0), ch(1), ch(2))
    })
}

fn draw_scaled(
    area: &Area<'_>,
    (h, w): (usize, usize),
    color_at: impl Fn(usize, usize) -> RGBColor,
) -> Result<()> {
    let (aw, ah) = area.dim_in_pixel();
    if h == 0 || w == 0 || aw == 0 || ah == 0 {
        return Ok(());
    }
    let scale = (aw as f64 / w as f64).min(ah as f64 / h as f64);
    let (ow, oh) = ((w as f64 * scale) as u32, (h as f64 * scale) as u32);
    let (ox, oy) = ((aw - ow) / 2, (ah - oh) / 2);
    for py in 0..oh {
        let sy = ((py as f64 / scale) as usize).min(h - 1);
        for px in 0..ow {
            let sx = ((px as f64 / scale) as usize).min(w - 1);
            area.draw_pixel(((ox + px) as i32, (oy + py) as i32), &color_at(sy, sx))
                .map_err(render_err)?;
        }
    }
    Ok(())
}

fn draw_colorbar(area: &Area<'_>, bound: f32, ticks: &[f32], annotate: bool) -> Result<()> {
    let (_, ah) = area.dim_in_pixel();
    let margin = (ah / 10).max(4);
    let bar_h = ah.saturating_sub(2 * margin).max(1);
    let (x0, x1) = (8i32, 26i32);
    for i in 0..bar_h {
        // Top is +bound.
        let v = bound * (1.0 - 2.0 * i as f32 / bar_h as f32);
        let y = (margin + i) as i32;
        area.draw(&Rectangle::new([(x0, y), (x1, y + 1)], diverging_color(v, bound).filled()))
            .map_err(render_err)?;
    }
    if annotate && bound > 0.0 {
        let style = TICK_FONT.into_font().color(&BLACK);
        for &t in ticks {
            let frac = ((bound - t) / (2.0 * bound)).clamp(0.0, 1.0);
            let y = margin as i32 + (frac * bar_h as f32) as i32;
            area.draw(&PathElement::new(vec![(x1, y), (x1 + 4, y)], BLACK.stroke_width(1)))
                .map_err(render_err)?;
            area.draw_text(&format!("{t:.3}"), &style, (x1 + 7, y - 6))
                .map_err(render_err)?;
        }
    }
    Ok(())
}

fn prepare(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Figures

/// What the weight grid render produced.
#[derive(Debug, Clone)]
pub struct RenderedGrid {
    /// The filtered slice, for the overlays.
    pub slice: WeightSlice,
    /// `(C, H, W)` of the tiled grid.
    pub grid_dim: (usize, usize, usize),
    pub columns: usize,
    /// Figure size in screen pixels.
    pub figure_px: (u32, u32),
    pub path: PathBuf,
}

/// Everything written for one example.
#[derive(Debug, Clone)]
pub struct ExampleArtifacts {
    pub example: usize,
    pub selection: ActivationSelection,
    pub input: PathBuf,
    pub grid: RenderedGrid,
    pub overlays: Vec<PathBuf>,
}

pub struct Visualizer {
    cfg: VisualizerConfig,
}

impl Visualizer {
    pub fn new(cfg: VisualizerConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &VisualizerConfig {
        &self.cfg
    }

    /// Input snapshot as a diverging heatmap (first channel) with a color bar.
    pub fn render_input(&self, input: ArrayView1<'_, f32>, shape: ImageShape, path: &Path) -> Result<()> {
        if input.len() != shape.numel() {
            return Err(HebbError::shape(format!(
                "input has {} values, expected {}",
                input.len(),
                shape.numel()
            )));
        }
        let plane = input.slice(s![..shape.plane()]);
        let image = plane.into_shape_with_order((shape.height, shape.width))?;
        let bound = max_abs(image.iter());
        let (lo, hi) = min_max(image.iter());

        let k = self.cfg.panel_scale.max(1);
        let (w, h) = (shape.width as u32 * k, shape.height as u32 * k);
        prepare(path)?;
        let root = BitMapBackend::new(path, (w + COLORBAR_PX, h)).into_drawing_area();
        root.fill(&WHITE).map_err(render_err)?;
        let (img_area, bar_area) = root.split_horizontally(w as i32);
        draw_heatmap(&img_area, image, bound)?;
        draw_colorbar(&bar_area, bound, &[lo, hi], self.cfg.annotate)?;
        root.present().map_err(render_err)?;
        info!(path = %path.display(), "wrote input snapshot");
        Ok(())
    }

    /// Selects, filters and tiles the activated units' weights and renders
    /// the grid. Fails with `EmptySelection` if nothing is left to draw.
    pub fn render_weight_grid(
        &self,
        weights: ArrayView2<'_, f32>,
        shape: ImageShape,
        selection: &ActivationSelection,
        path: &Path,
    ) -> Result<RenderedGrid> {
        if selection.is_empty() {
            return Err(HebbError::EmptySelection(format!(
                "no unit above cutoff {}",
                selection.cutoff
            )));
        }
        let mut slice = WeightSlice::select(weights, shape, selection)?;
        if let Some(threshold) = self.cfg.filter_threshold {
            slice = slice.filter_energy(threshold);
        }
        info!(selected = selection.len(), kept = slice.len(), "filtered weight slice");
        if slice.is_empty() {
            return Err(HebbError::EmptySelection(format!(
                "all {} selected units failed the energy filter",
                selection.len()
            )));
        }

        let columns = grid_columns(slice.len());
        let grid = make_grid(&slice, columns, GRID_PADDING)?;
        let (c, gh, gw) = grid.dim();
        let cell = (self.cfg.target_px as usize / gh.max(gw)).clamp(1, 16) as u32;
        let (w, h) = (gw as u32 * cell, gh as u32 * cell);
        let single = c == 1;
        let figure_px = (w + if single { COLORBAR_PX } else { 0 }, h);

        prepare(path)?;
        let root = BitMapBackend::new(path, figure_px).into_drawing_area();
        root.fill(&WHITE).map_err(render_err)?;
        if single {
            let plane = grid.index_axis(Axis(0), 0);
            let bound = max_abs(plane.iter());
            let (lo, hi) = min_max(plane.iter());
            let (img_area, bar_area) = root.split_horizontally(w as i32);
            draw_heatmap(&img_area, plane, bound)?;
            draw_colorbar(&bar_area, bound, &[lo, 0.0, hi], self.cfg.annotate)?;
        } else {
            let (lo, hi) = min_max(grid.iter());
            let span = hi - lo;
            let normalized = if span > 0.0 {
                grid.mapv(|v| (v - lo) / span)
            } else {
                Array3::zeros(grid.raw_dim())
            };
            draw_rgb(&root, normalized.view())?;
        }
        root.present().map_err(render_err)?;
        info!(path = %path.display(), units = slice.len(), columns, "wrote weight grid");

        Ok(RenderedGrid {
            slice,
            grid_dim: (c, gh, gw),
            columns,
            figure_px,
            path: path.to_path_buf(),
        })
    }

    /// One figure per unit, in slice order: input, unit weights and their
    /// product on a shared scale.
    pub fn render_overlays(&self, slice: &WeightSlice, input: ArrayView1<'_, f32>, dir: &Path) -> Result<Vec<PathBuf>> {
        let shape = slice.shape;
        if input.len() != shape.numel() {
            return Err(HebbError::shape(format!(
                "input has {} values, expected {}",
                input.len(),
                shape.numel()
            )));
        }
        if slice.is_empty() {
            return Err(HebbError::EmptySelection("no units to overlay".into()));
        }
        let inp = input.into_shape_with_order((shape.channels, shape.height, shape.width))?;
        let k = self.cfg.panel_scale.max(1);
        let (pw, ph) = (shape.width as u32 * k, shape.height as u32 * k);
        let title_h = if self.cfg.annotate { 30 } else { 0 };
        let caption_h = if self.cfg.annotate { 36 } else { 0 };
        let gap = 12u32;
        let panels_w = 3 * (pw + gap);

        let mut paths = Vec::with_capacity(slice.len());
        for (rank, (&unit, &activation)) in slice.units.iter().zip(&slice.activations).enumerate() {
            let weights = slice.image(rank)?;
            let product = &inp * &weights;
            let images = [inp.index_axis(Axis(0), 0), weights.index_axis(Axis(0), 0), product.index_axis(Axis(0), 0)];
            let bound = images.iter().map(|im| max_abs(im.iter())).fold(0.0f32, f32::max);
            let (lo, hi) = images
                .iter()
                .map(|im| min_max(im.iter()))
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), (c, d)| (a.min(c), b.max(d)));

            let path = dir.join(format!("overlay_{rank:03}_unit_{unit:04}.png"));
            prepare(&path)?;
            let size = (panels_w + COLORBAR_PX, ph + title_h + caption_h);
            let root = BitMapBackend::new(&path, size).into_drawing_area();
            root.fill(&WHITE).map_err(render_err)?;
            let body = if self.cfg.annotate {
                root.titled(&format!("Activation = {activation}"), TITLE_FONT)
                    .map_err(render_err)?
            } else {
                root.clone()
            };
            let (panels, bar) = body.split_horizontally(panels_w as i32);
            for (panel, (image, title)) in panels
                .split_evenly((1, 3))
                .iter()
                .zip(images.iter().zip(["input", "unit weights", "multiplied"]))
            {
                let inner = if self.cfg.annotate {
                    panel.titled(title, TICK_FONT).map_err(render_err)?
                } else {
                    panel.clone()
                };
                draw_heatmap(&inner, image.view(), bound)?;
            }
            draw_colorbar(&bar, bound, &[lo, hi], self.cfg.annotate)?;
            root.present().map_err(render_err)?;
            paths.push(path.clone());
        }
        info!(dir = %dir.display(), figures = paths.len(), "wrote overlays");
        Ok(paths)
    }

    /// Full pipeline for one example: select units from `activations`,
    /// render the input, the weight grid and the overlays under
    /// `<out_dir>/example_<i>/`.
    pub fn visualize_example(
        &self,
        example: usize,
        input: ArrayView1<'_, f32>,
        activations: ArrayView1<'_, f32>,
        weights: ArrayView2<'_, f32>,
        shape: ImageShape,
    ) -> Result<ExampleArtifacts> {
        let selection = select(activations, self.cfg.cutoff);
        match (selection.min_value(), selection.max_value()) {
            (Some(lo), Some(hi)) => info!(
                example,
                cutoff = self.cfg.cutoff,
                activated = selection.len(),
                min = lo,
                max = hi,
                "selected units"
            ),
            _ => warn!(example, cutoff = self.cfg.cutoff, "no unit above cutoff"),
        }

        let dir = self.cfg.out_dir.join(format!("example_{example}"));
        let grid = self.render_weight_grid(weights, shape, &selection, &dir.join("weights.png"))?;
        let input_path = dir.join("input.png");
        self.render_input(input, shape, &input_path)?;
        let overlays = self.render_overlays(&grid.slice, input, &dir)?;

        Ok(ExampleArtifacts {
            example,
            selection,
            input: input_path,
            grid,
            overlays,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn selection(indices: Vec<usize>) -> ActivationSelection {
        let values = (0..indices.len()).rev().map(|v| v as f32 + 1.0).collect();
        ActivationSelection {
            cutoff: 0.0,
            indices,
            values,
        }
    }

    fn quiet() -> Visualizer {
        Visualizer::new(VisualizerConfig::default().with_annotate(false))
    }

    #[test]
    fn energy_filter_boundaries() {
        assert_eq!(cubic_energy(Array1::<f32>::zeros(9).view()), 0.0);
        assert_eq!(cubic_energy(array![2.0f32].view()), 8.0);

        let shape = ImageShape::new(1, 1, 2);
        let w = array![[0.0, 0.0], [2.0, 0.0], [1.0, 0.0], [-0.5, 0.5]];
        let slice = WeightSlice::select(w.view(), shape, &selection(vec![0, 1, 2, 3]))
            .unwrap()
            .filter_energy(FILTER_THRESHOLD);
        // zeros kept, 8.0 dropped, 1.0 kept, 0.25 kept
        assert_eq!(slice.units, vec![0, 2, 3]);
        assert_eq!(slice.rows.nrows(), 3);
        assert_eq!(slice.activations.len(), 3);

        let exact = array![[1.1f32.cbrt(), 0.0]];
        let s = WeightSlice::select(exact.view(), shape, &selection(vec![0]))
            .unwrap()
            .filter_energy(cubic_energy(exact.row(0)));
        assert!(s.is_empty());
    }

    #[test]
    fn filter_keeps_activations_aligned() {
        let shape = ImageShape::new(1, 1, 1);
        let w = array![[0.1], [5.0], [0.2]];
        let sel = ActivationSelection {
            cutoff: 0.0,
            indices: vec![2, 1, 0],
            values: vec![3.0, 2.0, 1.0],
        };
        let slice = WeightSlice::select(w.view(), shape, &sel).unwrap().filter_energy(1.1);
        assert_eq!(slice.units, vec![2, 0]);
        assert_eq!(slice.activations, vec![3.0, 1.0]);
        assert_eq!(slice.rows, array![[0.2], [0.1]]);
    }

    #[test]
    fn select_rejects_incompatible_shape() {
        let w = Array2::<f32>::zeros((4, 10));
        let err = WeightSlice::select(w.view(), ImageShape::new(1, 3, 3), &selection(vec![0])).unwrap_err();
        assert!(matches!(err, HebbError::Shape(_)));
        let err = WeightSlice::select(w.view(), ImageShape::new(1, 2, 5), &selection(vec![4])).unwrap_err();
        assert!(matches!(err, HebbError::Shape(_)));
    }

    #[test]
    fn grid_columns_is_ceil_sqrt() {
        let cases = [(1, 1), (2, 2), (4, 2), (5, 3), (9, 3), (10, 4), (37, 7), (2000, 45)];
        for (n, want) in cases {
            assert_eq!(grid_columns(n), want, "n={n}");
        }
    }

    #[test]
    fn grid_tiles_with_padding() {
        let shape = ImageShape::new(1, 2, 3);
        let w = Array2::from_shape_fn((5, 6), |(i, _)| i as f32 + 1.0);
        let slice = WeightSlice::select(w.view(), shape, &selection(vec![0, 1, 2, 3, 4])).unwrap();
        let grid = make_grid(&slice, grid_columns(5), 2).unwrap();
        // 3 columns, 2 rows: H = 2*(2+2)+2, W = 3*(3+2)+2
        assert_eq!(grid.dim(), (1, 10, 17));
        assert_eq!(grid[[0, 0, 0]], 0.0);
        assert_eq!(grid[[0, 2, 2]], 1.0);
        assert_eq!(grid[[0, 2, 7]], 2.0);
        assert_eq!(grid[[0, 6, 2]], 4.0);
        // Unused last tile stays padding.
        assert_eq!(grid[[0, 6, 12]], 0.0);
    }

    #[test]
    fn empty_grid_is_an_empty_selection() {
        let slice = WeightSlice {
            shape: ImageShape::new(1, 1, 1),
            units: vec![],
            activations: vec![],
            rows: Array2::zeros((0, 1)),
        };
        assert!(matches!(make_grid(&slice, 1, 2), Err(HebbError::EmptySelection(_))));
    }

    #[test]
    fn diverging_scale_endpoints() {
        assert_eq!(diverging_color(-1.0, 1.0), RGBColor(0, 0, 255));
        assert_eq!(diverging_color(0.0, 1.0), RGBColor(255, 255, 255));
        assert_eq!(diverging_color(1.0, 1.0), RGBColor(255, 0, 0));
        assert_eq!(diverging_color(3.0, 0.0), RGBColor(255, 255, 255));
        assert_eq!(diverging_color(-5.0, 1.0), RGBColor(0, 0, 255));
    }

    #[test]
    fn weight_grid_render_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let shape = ImageShape::new(1, 4, 4);
        let w = Array2::from_shape_fn((12, 16), |(i, j)| ((i * 16 + j) as f32 * 0.37).sin() * 0.3);
        let sel = selection(vec![3, 7, 1, 0, 11]);
        let vis = quiet();

        let a = vis.render_weight_grid(w.view(), shape, &sel, &dir.path().join("a.png")).unwrap();
        let b = vis.render_weight_grid(w.view(), shape, &sel, &dir.path().join("b.png")).unwrap();
        assert_eq!(a.slice.len(), b.slice.len());
        assert_eq!(a.grid_dim, b.grid_dim);
        assert_eq!(a.figure_px, b.figure_px);
        assert_eq!(a.slice, b.slice);
        assert!(a.path.exists() && b.path.exists());
        assert_eq!(a.columns, 3);
    }

    #[test]
    fn multichannel_grid_renders_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let shape = ImageShape::new(3, 2, 2);
        let w = Array2::from_shape_fn((4, 12), |(i, j)| (i + j) as f32 * 0.01);
        let out = quiet()
            .render_weight_grid(w.view(), shape, &selection(vec![0, 1, 2, 3]), &dir.path().join("rgb.png"))
            .unwrap();
        assert_eq!(out.grid_dim.0, 3);
        assert!(out.path.exists());
    }

    #[test]
    fn empty_selection_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let w = Array2::<f32>::zeros((3, 4));
        let err = quiet()
            .render_weight_grid(w.view(), ImageShape::new(1, 2, 2), &selection(vec![]), &dir.path().join("x.png"))
            .unwrap_err();
        assert!(matches!(err, HebbError::EmptySelection(_)));
        assert!(!dir.path().join("x.png").exists());

        let big = Array2::<f32>::from_elem((2, 4), 3.0);
        let err = quiet()
            .render_weight_grid(big.view(), ImageShape::new(1, 2, 2), &selection(vec![0, 1]), &dir.path().join("y.png"))
            .unwrap_err();
        assert!(matches!(err, HebbError::EmptySelection(_)));
    }

    #[test]
    fn example_pipeline_writes_one_overlay_per_kept_unit() {
        let dir = tempfile::tempdir().unwrap();
        let vis = Visualizer::new(
            VisualizerConfig::default()
                .with_annotate(false)
                .with_out_dir(dir.path()),
        );
        let shape = ImageShape::new(1, 3, 3);
        let mut w = Array2::from_shape_fn((6, 9), |(i, j)| if (i + j) % 2 == 0 { 0.2 } else { -0.1 });
        w.row_mut(4).fill(1.0); // energy 9, filtered out
        let input = Array1::from_shape_fn(9, |j| j as f32 / 9.0);
        let activations = array![0.5, -0.2, 0.0, 1.5, 2.0, 0.1];

        let art = vis
            .visualize_example(3, input.view(), activations.view(), w.view(), shape)
            .unwrap();
        assert_eq!(art.selection.indices, vec![4, 3, 0, 5]);
        assert_eq!(art.grid.slice.units, vec![3, 0, 5]);
        assert_eq!(art.overlays.len(), 3);
        assert!(art.input.ends_with("example_3/input.png"));
        assert!(art.overlays[0].ends_with("overlay_000_unit_0003.png"));
        assert!(art.overlays.iter().all(|p| p.exists()));
        assert!(art.grid.path.exists());
    }
}
