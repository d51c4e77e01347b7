//! Plots an image next to the predicted class probabilities, and training curves

use std::{error::Error, path::Path};

use plotters::{
    chart::ChartBuilder,
    element::PathElement,
    prelude::{BitMapBackend, Circle, IntoDrawingArea, Rectangle},
    series::LineSeries,
    style::{BLACK, BLUE, Color, RED, RGBColor, WHITE},
};

use crate::train::EpochStats;

/// Renders a grayscale image on the left and a horizontal bar per class on the right.
///
/// `intensities` are row-major in `[0, 1]`, `probs[i]` is the probability of
/// `class_names[i]`. Class 0 is drawn at the top.
pub fn view_classify(
    intensities: &[f32],
    rows: usize,
    cols: usize,
    probs: &[f32],
    class_names: &[&str],
    file_name: &Path,
) -> Result<(), Box<dyn Error>> {
    if intensities.len() != rows * cols {
        return Err(format!(
            "Image has {} pixels, expected {}x{}",
            intensities.len(),
            rows,
            cols
        )
        .into());
    }
    if probs.len() != class_names.len() {
        return Err(format!(
            "{} probabilities for {} class names",
            probs.len(),
            class_names.len()
        )
        .into());
    }

    let root_area = BitMapBackend::new(file_name, (900, 450)).into_drawing_area();
    root_area.fill(&WHITE)?;
    let panels = root_area.split_evenly((1, 2));

    let mut image = ChartBuilder::on(&panels[0])
        .caption("Input", ("sans-serif", 30))
        .margin(20)
        .build_cartesian_2d(0f32..cols as f32, 0f32..rows as f32)?;
    image.draw_series(intensities.iter().enumerate().map(|(i, v)| {
        let (r, c) = ((i / cols) as f32, (i % cols) as f32);
        let level = (v.clamp(0.0, 1.0) * 255.0) as u8;
        // row 0 is the top of the image
        let top = rows as f32 - r;
        Rectangle::new(
            [(c, top - 1.0), (c + 1.0, top)],
            RGBColor(level, level, level).filled(),
        )
    }))?;

    let n = class_names.len();
    let label = |y: &f32| {
        let rounded = y.round();
        if (y - rounded).abs() > 1e-3 || rounded < 0.0 || rounded >= n as f32 {
            return String::new();
        }
        class_names[n - 1 - rounded as usize].to_string()
    };
    let mut bars = ChartBuilder::on(&panels[1])
        .caption("Class Probability", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(100)
        .build_cartesian_2d(0f32..1.1f32, -0.5f32..(n as f32 - 0.5))?;
    bars.configure_mesh()
        .disable_y_mesh()
        .y_labels(n)
        .y_label_formatter(&label)
        .draw()?;
    bars.draw_series(probs.iter().enumerate().map(|(i, p)| {
        let y = (n - 1 - i) as f32;
        Rectangle::new([(0.0, y - 0.35), (p.clamp(0.0, 1.0), y + 0.35)], BLUE.mix(0.6).filled())
    }))?;

    root_area.present()?;
    log::info!("Classification plot saved to '{}'.", file_name.display());
    Ok(())
}

/// Plots the per-epoch training loss, and the training accuracy on the same axes
pub fn plot_loss_history(history: &[EpochStats], file_name: &Path) -> Result<(), Box<dyn Error>> {
    if history.is_empty() {
        return Err("No epochs to plot".into());
    }
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let max_loss = history.iter().map(|s| s.loss).fold(1.0f32, f32::max);
    let last_epoch = history.len() as f32 + 0.5;
    let mut chart = ChartBuilder::on(&root_area)
        .caption("Training loss", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0.5f32..last_epoch, 0f32..max_loss * 1.1)?;
    chart
        .configure_mesh()
        .x_desc("epoch")
        .draw()?;

    let loss_points = history.iter().map(|s| (s.epoch as f32, s.loss));
    chart
        .draw_series(LineSeries::new(loss_points.clone(), &RED))?
        .label("loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart.draw_series(loss_points.map(|p| Circle::new(p, 3, RED.filled())))?;

    let accuracy_points = history.iter().map(|s| (s.epoch as f32, s.accuracy));
    chart
        .draw_series(LineSeries::new(accuracy_points, &BLUE))?
        .label("accuracy")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss curve saved to '{}'.", file_name.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_classify_rejects_bad_shapes() {
        let out = std::env::temp_dir().join("mnist-grad-viz-unused.png");
        let err = view_classify(&[0.0; 3], 2, 2, &[1.0], &["a"], &out).unwrap_err();
        assert!(err.to_string().contains("expected 2x2"));

        let err = view_classify(&[0.0; 4], 2, 2, &[0.5, 0.5], &["a"], &out).unwrap_err();
        assert!(err.to_string().contains("2 probabilities for 1 class names"));
        assert!(plot_loss_history(&[], &out).is_err());
    }

    #[test]
    fn test_plots_are_written() {
        let dir = std::env::temp_dir().join(format!("mnist-grad-viz-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let classify = dir.join("classify.png");
        view_classify(&[0.0, 1.0, 0.5, 0.25], 2, 2, &[0.25, 0.75], &["a", "b"], &classify).unwrap();
        assert!(std::fs::metadata(&classify).unwrap().len() > 0);

        let history = (1..=2)
            .map(|epoch| EpochStats {
                epoch,
                loss: 1.0 / epoch as f32,
                accuracy: 0.4 * epoch as f32,
                n_batches: 3,
                elapsed_ms: 10,
            })
            .collect::<Vec<_>>();
        let loss = dir.join("loss.png");
        plot_loss_history(&history, &loss).unwrap();
        assert!(std::fs::metadata(&loss).unwrap().len() > 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
