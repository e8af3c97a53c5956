//! Matemática de grillas web mercator (tiles de 256 px).

use std::f64::consts::PI;

const TILE_SIZE: f64 = 256.0;

fn pixels_at_zoom(zoom: u32) -> f64 {
    TILE_SIZE * 2f64.powi(zoom as i32)
}

/// Longitud del borde oeste de la columna de píxel `x`.
pub fn pixel_to_lon(x: f64, zoom: u32) -> f64 {
    x / pixels_at_zoom(zoom) * 360.0 - 180.0
}

/// Latitud del borde norte de la fila de píxel `y`.
pub fn pixel_to_lat(y: f64, zoom: u32) -> f64 {
    let tile = y / TILE_SIZE;
    let n = PI - tile * PI * 2.0 / 2f64.powi(zoom as i32);
    n.sinh().atan().to_degrees()
}

pub fn pixel_to_center_lon(x: i64, zoom: u32) -> f64 {
    pixel_to_lon(x as f64 + 0.5, zoom)
}

pub fn pixel_to_center_lat(y: i64, zoom: u32) -> f64 {
    pixel_to_lat(y as f64 + 0.5, zoom)
}
