use crate::error::FlyError;
use crate::readback::ReadbackSeries;
use textplots::{Chart, Plot, Shape};

/// Readback positions against time since the first sample.
fn frame(series: &ReadbackSeries) -> Vec<(f32, f32)> {
    let t0 = series.timestamps.first().copied().unwrap_or_default();
    series
        .iter()
        .map(|(position, t)| ((t - t0) as f32, position as f32))
        .collect()
}

/// Draw a readback series in the terminal.
///
/// # Examples
/// ```
/// use pvt_flyer::plotting::plot_readback;
/// use pvt_flyer::readback::align;
///
/// let series = align(&[0.0, 0.1, 0.2, 0.3], 0.0, 3, 2, 0.05);
/// plot_readback(&series, "ss_x", "mm", None).unwrap();
/// ```
pub fn plot_readback(
    series: &ReadbackSeries,
    axis: &str,
    unit: &str,
    size: Option<(u32, u32)>,
) -> Result<(), FlyError> {
    if series.is_empty() {
        return Err(FlyError::Validation(format!("no readback to plot for {axis}")));
    }
    let (width, height) = size.unwrap_or((120, 40));

    let points = frame(series);
    let span = points.last().map(|p| p.0).unwrap_or_default().max(f32::EPSILON);
    let (lo, hi) = series
        .positions
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| (lo.min(p), hi.max(p)));

    println!("{axis} readback, {} samples", series.len());
    println!("Position {lo:.4} to {hi:.4} {unit} over {span:.3} s");
    println!("{}", "─".repeat(width as usize / 2));

    Chart::new(width, height, 0.0, span)
        .lineplot(&Shape::Points(&points))
        .nice();

    println!("Time since first sample (s) →");
    Ok(())
}
