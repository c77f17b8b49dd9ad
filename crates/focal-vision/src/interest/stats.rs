//! Constant-time window statistics over a grayscale image.

use image::GrayImage;
use imageproc::gradients::sobel_gradients;

use crate::resources::{RequestScope, Tracked};

/// Summed-area tables for intensity, squared intensity and edge pixels.
/// The tables stay registered with the request scope while alive.
pub struct WindowStats<'s> {
    width: u32,
    height: u32,
    sum: Tracked<'s, Vec<f64>>,
    sum_sq: Tracked<'s, Vec<f64>>,
    edges: Tracked<'s, Vec<f64>>,
}

/// Mean, standard deviation and edge density of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub mean: f64,
    pub std_dev: f64,
    /// Fraction of pixels whose Sobel magnitude exceeds the edge threshold
    pub edge_density: f64,
}

impl<'s> WindowStats<'s> {
    pub fn new(gray: &GrayImage, edge_magnitude: u16, scope: &'s RequestScope<'_>) -> Self {
        let (width, height) = gray.dimensions();
        let gradients = scope.track("interest_sobel", sobel_gradients(gray));

        let stride = width as usize + 1;
        let cells = stride * (height as usize + 1);
        let mut sum = scope.track("interest_integral", vec![0.0f64; cells]);
        let mut sum_sq = scope.track("interest_integral_sq", vec![0.0f64; cells]);
        let mut edges = scope.track("interest_integral_edges", vec![0.0f64; cells]);

        for y in 0..height as usize {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            let mut row_edges = 0.0;
            for x in 0..width as usize {
                let v = gray.get_pixel(x as u32, y as u32)[0] as f64;
                row_sum += v;
                row_sq += v * v;
                if gradients.get_pixel(x as u32, y as u32)[0] > edge_magnitude {
                    row_edges += 1.0;
                }

                let idx = (y + 1) * stride + x + 1;
                let above = y * stride + x + 1;
                sum[idx] = sum[above] + row_sum;
                sum_sq[idx] = sum_sq[above] + row_sq;
                edges[idx] = edges[above] + row_edges;
            }
        }

        Self {
            width,
            height,
            sum,
            sum_sq,
            edges,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Statistics of the `w`×`h` window at `(x, y)`, clipped to the image.
    pub fn window(&self, x: u32, y: u32, w: u32, h: u32) -> Window {
        let x1 = x.min(self.width) as usize;
        let y1 = y.min(self.height) as usize;
        let x2 = x.saturating_add(w).min(self.width) as usize;
        let y2 = y.saturating_add(h).min(self.height) as usize;

        let n = ((x2 - x1) * (y2 - y1)) as f64;
        if n == 0.0 {
            return Window {
                mean: 0.0,
                std_dev: 0.0,
                edge_density: 0.0,
            };
        }

        let mean = self.area_sum(&self.sum, x1, y1, x2, y2) / n;
        let variance = (self.area_sum(&self.sum_sq, x1, y1, x2, y2) / n - mean * mean).max(0.0);
        let edge_density = self.area_sum(&self.edges, x1, y1, x2, y2) / n;

        Window {
            mean,
            std_dev: variance.sqrt(),
            edge_density,
        }
    }

    fn area_sum(&self, table: &[f64], x1: usize, y1: usize, x2: usize, y2: usize) -> f64 {
        let stride = self.width as usize + 1;
        table[y2 * stride + x2] - table[y1 * stride + x2] - table[y2 * stride + x1]
            + table[y1 * stride + x1]
    }
}
