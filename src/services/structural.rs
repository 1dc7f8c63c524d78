use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::models::job::StageId;
use crate::models::validation::{
    SkipReason, StructuralMetrics, TriggerId, ValidationMode, ValidationSummary, ValidationTrigger,
};

/// Longest side of the working resolution used for comparison.
const WORKING_MAX_DIMENSION: u32 = 1024;

/// Relative aspect-ratio difference beyond which images are not comparable.
const ASPECT_TOLERANCE: f64 = 0.02;

/// Gaussian sigma applied before gradient estimation.
const BLUR_SIGMA: f32 = 1.2;

/// Line classification window around vertical / horizontal, in degrees.
const LINE_WINDOW_DEG: f64 = 10.0;

/// Which edge set must be explained by the other for the overlap metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlapDirection {
    /// Neither image may gain or lose edges.
    Symmetric,
    /// Every baseline edge must survive; new edges are allowed.
    BaselinePreserved,
    /// Candidate may lose edges but must not invent new ones.
    CandidateContained,
}

/// Per-stage thresholds. Non-fatal limits raise corroborating signals,
/// fatal limits fail the comparison on their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageThresholds {
    pub overlap_direction: OverlapDirection,
    pub min_edge_overlap: f64,
    pub fatal_edge_overlap: f64,
    pub max_line_deviation_deg: f64,
    pub fatal_line_deviation_deg: f64,
    pub max_masked_difference: f64,
    pub fatal_masked_difference: f64,
}

impl StageThresholds {
    /// Enhancement must not move any edge.
    pub fn stage_1a() -> Self {
        Self {
            overlap_direction: OverlapDirection::Symmetric,
            min_edge_overlap: 0.75,
            fatal_edge_overlap: 0.40,
            max_line_deviation_deg: 2.0,
            fatal_line_deviation_deg: 6.0,
            max_masked_difference: 0.25,
            fatal_masked_difference: 0.60,
        }
    }

    /// Decluttering removes furniture edges but must not add structure.
    pub fn stage_1b() -> Self {
        Self {
            overlap_direction: OverlapDirection::CandidateContained,
            min_edge_overlap: 0.55,
            fatal_edge_overlap: 0.25,
            max_line_deviation_deg: 3.0,
            fatal_line_deviation_deg: 8.0,
            max_masked_difference: 0.40,
            fatal_masked_difference: 0.75,
        }
    }

    /// Staging adds furniture edges; existing architecture must survive.
    pub fn stage_2() -> Self {
        Self {
            overlap_direction: OverlapDirection::BaselinePreserved,
            min_edge_overlap: 0.40,
            fatal_edge_overlap: 0.15,
            max_line_deviation_deg: 5.0,
            fatal_line_deviation_deg: 12.0,
            max_masked_difference: 0.55,
            fatal_masked_difference: 0.85,
        }
    }
}

/// Validator configuration shared by all stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    /// Distinct non-fatal triggers needed to flag risk.
    pub min_signals: usize,
    pub stage_1a_mode: ValidationMode,
    pub stage_1b_mode: ValidationMode,
    pub stage_2_mode: ValidationMode,
    pub stage_1a: StageThresholds,
    pub stage_1b: StageThresholds,
    pub stage_2: StageThresholds,
    /// Sobel magnitude at which a pixel counts as a significant edge.
    pub edge_threshold: f32,
    /// Masks covering less than this fraction of the image are ignored.
    pub min_mask_fraction: f64,
    /// Luma delta at which a structural pixel counts as changed.
    pub pixel_difference_threshold: u8,
    /// Edge pixels needed before a line family is compared.
    pub min_line_samples: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_signals: 2,
            stage_1a_mode: ValidationMode::Block,
            stage_1b_mode: ValidationMode::Block,
            stage_2_mode: ValidationMode::Block,
            stage_1a: StageThresholds::stage_1a(),
            stage_1b: StageThresholds::stage_1b(),
            stage_2: StageThresholds::stage_2(),
            edge_threshold: 80.0,
            min_mask_fraction: 0.002,
            pixel_difference_threshold: 40,
            min_line_samples: 50,
        }
    }
}

impl ValidationConfig {
    pub fn mode_for(&self, stage: StageId) -> ValidationMode {
        match stage {
            StageId::Stage1A => self.stage_1a_mode,
            StageId::Stage1B => self.stage_1b_mode,
            StageId::Stage2 => self.stage_2_mode,
        }
    }

    pub fn thresholds_for(&self, stage: StageId) -> &StageThresholds {
        match stage {
            StageId::Stage1A => &self.stage_1a,
            StageId::Stage1B => &self.stage_1b,
            StageId::Stage2 => &self.stage_2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("Failed to decode baseline image: {0}")]
    Baseline(#[source] image::ImageError),

    #[error("Failed to decode candidate image: {0}")]
    Candidate(#[source] image::ImageError),
}

/// Compare a stage's input against its output.
///
/// Byte-identical inputs short-circuit to a clean pass. Images whose aspect
/// ratios cannot be reconciled produce an inconclusive (non-risky) summary
/// with a `dimension_mismatch` skip reason.
pub fn validate(
    stage: StageId,
    baseline: &[u8],
    candidate: &[u8],
    config: &ValidationConfig,
) -> Result<ValidationSummary, ValidatorError> {
    let mode = config.mode_for(stage);

    if baseline == candidate {
        return Ok(ValidationSummary {
            stage,
            mode,
            risk: false,
            score: 1.0,
            triggers: Vec::new(),
            skipped: Vec::new(),
            metrics: StructuralMetrics {
                edge_overlap: Some(1.0),
                line_angle_deviation_deg: Some(0.0),
                masked_difference: Some(0.0),
            },
        });
    }

    let base = image::load_from_memory(baseline)
        .map_err(ValidatorError::Baseline)?
        .to_luma8();
    let cand = image::load_from_memory(candidate)
        .map_err(ValidatorError::Candidate)?
        .to_luma8();

    match normalize(&base, &cand) {
        Ok((base, cand)) => Ok(compare(stage, &base, &cand, config)),
        Err(reason) => {
            tracing::warn!(
                stage = %stage,
                baseline = ?base.dimensions(),
                candidate = ?cand.dimensions(),
                "Structural comparison skipped"
            );
            Ok(ValidationSummary {
                stage,
                mode,
                risk: false,
                score: 1.0,
                triggers: Vec::new(),
                skipped: vec![reason],
                metrics: StructuralMetrics::default(),
            })
        }
    }
}

/// Bring both images to a common working resolution.
fn normalize(base: &GrayImage, cand: &GrayImage) -> Result<(GrayImage, GrayImage), SkipReason> {
    let (bw, bh) = base.dimensions();
    let (cw, ch) = cand.dimensions();
    if bw == 0 || bh == 0 || cw == 0 || ch == 0 {
        return Err(SkipReason::DimensionMismatch);
    }

    let base_aspect = f64::from(bw) / f64::from(bh);
    let cand_aspect = f64::from(cw) / f64::from(ch);
    if ((base_aspect - cand_aspect) / base_aspect).abs() > ASPECT_TOLERANCE {
        return Err(SkipReason::DimensionMismatch);
    }

    let (tw, th) = working_size(bw, bh);
    let resize = |img: &GrayImage| {
        if img.dimensions() == (tw, th) {
            img.clone()
        } else {
            imageops::resize(img, tw, th, FilterType::Triangle)
        }
    };
    Ok((resize(base), resize(cand)))
}

fn working_size(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= WORKING_MAX_DIMENSION {
        return (width, height);
    }
    let scale = f64::from(WORKING_MAX_DIMENSION) / f64::from(longest);
    (
        ((f64::from(width) * scale).round() as u32).max(1),
        ((f64::from(height) * scale).round() as u32).max(1),
    )
}

/// Score two same-sized grayscale images.
pub fn compare(
    stage: StageId,
    base: &GrayImage,
    cand: &GrayImage,
    config: &ValidationConfig,
) -> ValidationSummary {
    let thresholds = config.thresholds_for(stage);
    let base_grad = Gradients::of(base);
    let cand_grad = Gradients::of(cand);
    let base_mask = base_grad.edge_mask(config.edge_threshold);
    let cand_mask = cand_grad.edge_mask(config.edge_threshold);

    let mut skipped = Vec::new();
    let mut metrics = StructuralMetrics::default();

    let area = base_mask.pixels.len().max(1) as f64;
    let base_fraction = base_mask.count() as f64 / area;
    let cand_fraction = cand_mask.count() as f64 / area;
    let masks_usable =
        base_fraction >= config.min_mask_fraction && cand_fraction >= config.min_mask_fraction;

    if masks_usable {
        metrics.edge_overlap = Some(edge_overlap(
            &base_mask,
            &cand_mask,
            thresholds.overlap_direction,
        ));
    } else {
        skipped.push(SkipReason::EdgeMaskTooSmall);
    }

    let base_lines = base_grad.line_stats(&base_mask);
    let cand_lines = cand_grad.line_stats(&cand_mask);
    metrics.line_angle_deviation_deg = base_lines.deviation(&cand_lines, config.min_line_samples);
    if metrics.line_angle_deviation_deg.is_none() {
        skipped.push(SkipReason::InsufficientLines);
    }

    if base_fraction >= config.min_mask_fraction {
        let region = base_mask.dilate(2);
        metrics.masked_difference = Some(masked_difference(
            base,
            cand,
            &region,
            config.pixel_difference_threshold,
        ));
    } else if !skipped.contains(&SkipReason::EdgeMaskTooSmall) {
        skipped.push(SkipReason::EdgeMaskTooSmall);
    }

    let triggers = raise_triggers(stage, &metrics, thresholds);
    let risk = gate(&triggers, config.min_signals);

    ValidationSummary {
        stage,
        mode: config.mode_for(stage),
        risk,
        score: similarity_score(&metrics),
        triggers,
        skipped,
        metrics,
    }
}

/// Multi-signal gating: any fatal trigger, or enough distinct non-fatal ones.
pub fn gate(triggers: &[ValidationTrigger], min_signals: usize) -> bool {
    if triggers.iter().any(|t| t.fatal) {
        return true;
    }
    let mut distinct: Vec<TriggerId> = triggers.iter().map(|t| t.id).collect();
    distinct.sort_by_key(|id| *id as u8);
    distinct.dedup();
    distinct.len() >= min_signals.max(1)
}

fn raise_triggers(
    stage: StageId,
    metrics: &StructuralMetrics,
    t: &StageThresholds,
) -> Vec<ValidationTrigger> {
    let mut triggers = Vec::new();
    let mut push = |id: TriggerId, value: f64, threshold: f64, fatal: bool| {
        triggers.push(ValidationTrigger {
            id,
            value,
            threshold,
            fatal,
            stage,
        });
    };

    if let Some(overlap) = metrics.edge_overlap {
        if overlap < t.fatal_edge_overlap {
            push(TriggerId::EdgeOverlap, overlap, t.fatal_edge_overlap, true);
        } else if overlap < t.min_edge_overlap {
            push(TriggerId::EdgeOverlap, overlap, t.min_edge_overlap, false);
        }
    }

    if let Some(deviation) = metrics.line_angle_deviation_deg {
        if deviation > t.fatal_line_deviation_deg {
            push(
                TriggerId::LineAngleDeviation,
                deviation,
                t.fatal_line_deviation_deg,
                true,
            );
        } else if deviation > t.max_line_deviation_deg {
            push(
                TriggerId::LineAngleDeviation,
                deviation,
                t.max_line_deviation_deg,
                false,
            );
        }
    }

    if let Some(diff) = metrics.masked_difference {
        if diff > t.fatal_masked_difference {
            push(TriggerId::MaskedDifference, diff, t.fatal_masked_difference, true);
        } else if diff > t.max_masked_difference {
            push(TriggerId::MaskedDifference, diff, t.max_masked_difference, false);
        }
    }

    triggers
}

fn similarity_score(metrics: &StructuralMetrics) -> f64 {
    let parts: Vec<f64> = [
        metrics.edge_overlap,
        metrics
            .line_angle_deviation_deg
            .map(|d| 1.0 - (d / 45.0).min(1.0)),
        metrics.masked_difference.map(|d| 1.0 - d),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        1.0
    } else {
        parts.iter().sum::<f64>() / parts.len() as f64
    }
}

// ── Edge analysis ────────────────────────────────────────────────────

struct Gradients {
    width: u32,
    height: u32,
    gx: Vec<f32>,
    gy: Vec<f32>,
}

impl Gradients {
    /// Sobel gradients of a lightly blurred copy. Border pixels stay zero.
    fn of(img: &GrayImage) -> Self {
        let smooth = imageops::blur(img, BLUR_SIGMA);
        let (width, height) = smooth.dimensions();
        let len = (width * height) as usize;
        let mut gx = vec![0.0_f32; len];
        let mut gy = vec![0.0_f32; len];

        if width >= 3 && height >= 3 {
            let px = |x: u32, y: u32| f32::from(smooth.get_pixel(x, y)[0]);
            for y in 1..height - 1 {
                for x in 1..width - 1 {
                    let (tl, t, tr) = (px(x - 1, y - 1), px(x, y - 1), px(x + 1, y - 1));
                    let (l, r) = (px(x - 1, y), px(x + 1, y));
                    let (bl, b, br) = (px(x - 1, y + 1), px(x, y + 1), px(x + 1, y + 1));
                    let idx = (y * width + x) as usize;
                    gx[idx] = (tr + 2.0 * r + br) - (tl + 2.0 * l + bl);
                    gy[idx] = (bl + 2.0 * b + br) - (tl + 2.0 * t + tr);
                }
            }
        }

        Self {
            width,
            height,
            gx,
            gy,
        }
    }

    fn magnitude(&self, idx: usize) -> f32 {
        self.gx[idx].hypot(self.gy[idx])
    }

    fn edge_mask(&self, threshold: f32) -> EdgeMask {
        let pixels = (0..self.gx.len())
            .map(|idx| self.magnitude(idx) >= threshold)
            .collect();
        EdgeMask {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    /// Magnitude-weighted mean tilt of near-vertical and near-horizontal lines.
    fn line_stats(&self, mask: &EdgeMask) -> LineStats {
        let mut stats = LineStats::default();
        for (idx, on) in mask.pixels.iter().enumerate() {
            if !on {
                continue;
            }
            let weight = f64::from(self.magnitude(idx));
            let gradient_deg = f64::from(self.gy[idx]).atan2(f64::from(self.gx[idx])).to_degrees();
            // Lines run perpendicular to the gradient; fold into [0, 180).
            let line_deg = (gradient_deg + 90.0).rem_euclid(180.0);

            if (line_deg - 90.0).abs() <= LINE_WINDOW_DEG {
                stats.vertical.add(line_deg - 90.0, weight);
            } else if line_deg <= LINE_WINDOW_DEG {
                stats.horizontal.add(line_deg, weight);
            } else if line_deg >= 180.0 - LINE_WINDOW_DEG {
                stats.horizontal.add(line_deg - 180.0, weight);
            }
        }
        stats
    }
}

struct EdgeMask {
    width: u32,
    height: u32,
    pixels: Vec<bool>,
}

impl EdgeMask {
    fn count(&self) -> usize {
        self.pixels.iter().filter(|p| **p).count()
    }

    fn dilate(&self, radius: u32) -> EdgeMask {
        let (w, h) = (self.width as i64, self.height as i64);
        let r = radius as i64;
        let mut out = vec![false; self.pixels.len()];
        for y in 0..h {
            for x in 0..w {
                if !self.pixels[(y * w + x) as usize] {
                    continue;
                }
                for ny in (y - r).max(0)..=(y + r).min(h - 1) {
                    for nx in (x - r).max(0)..=(x + r).min(w - 1) {
                        out[(ny * w + nx) as usize] = true;
                    }
                }
            }
        }
        EdgeMask {
            width: self.width,
            height: self.height,
            pixels: out,
        }
    }

    /// Share of this mask's pixels that fall inside `other`.
    fn covered_by(&self, other: &EdgeMask) -> f64 {
        let total = self.count();
        if total == 0 {
            return 1.0;
        }
        let hits = self
            .pixels
            .iter()
            .zip(&other.pixels)
            .filter(|(a, b)| **a && **b)
            .count();
        hits as f64 / total as f64
    }
}

/// Edge overlap with a one-pixel tolerance for resampling jitter.
fn edge_overlap(base: &EdgeMask, cand: &EdgeMask, direction: OverlapDirection) -> f64 {
    let preserved = || base.covered_by(&cand.dilate(1));
    let contained = || cand.covered_by(&base.dilate(1));
    match direction {
        OverlapDirection::Symmetric => preserved().min(contained()),
        OverlapDirection::BaselinePreserved => preserved(),
        OverlapDirection::CandidateContained => contained(),
    }
}

/// Fraction of structural pixels whose luma changed beyond the threshold.
fn masked_difference(base: &GrayImage, cand: &GrayImage, region: &EdgeMask, threshold: u8) -> f64 {
    let mut total = 0_usize;
    let mut changed = 0_usize;
    for ((b, c), inside) in base.pixels().zip(cand.pixels()).zip(&region.pixels) {
        if !inside {
            continue;
        }
        total += 1;
        if b[0].abs_diff(c[0]) > threshold {
            changed += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        changed as f64 / total as f64
    }
}

#[derive(Default)]
struct AngleAccumulator {
    weighted_sum: f64,
    weight: f64,
    samples: usize,
}

impl AngleAccumulator {
    fn add(&mut self, angle: f64, weight: f64) {
        self.weighted_sum += angle * weight;
        self.weight += weight;
        self.samples += 1;
    }

    fn mean(&self, min_samples: usize) -> Option<f64> {
        (self.samples >= min_samples && self.weight > 0.0).then(|| self.weighted_sum / self.weight)
    }
}

#[derive(Default)]
struct LineStats {
    vertical: AngleAccumulator,
    horizontal: AngleAccumulator,
}

impl LineStats {
    /// Sum of mean tilt shifts over the line families both images share.
    fn deviation(&self, other: &LineStats, min_samples: usize) -> Option<f64> {
        let families = [
            (&self.vertical, &other.vertical),
            (&self.horizontal, &other.horizontal),
        ];
        let shifts: Vec<f64> = families
            .iter()
            .filter_map(|(a, b)| Some((a.mean(min_samples)? - b.mean(min_samples)?).abs()))
            .collect();
        (!shifts.is_empty()).then(|| shifts.iter().sum())
    }
}
