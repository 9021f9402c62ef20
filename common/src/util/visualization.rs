use crate::geom::{Point, Rect};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect as ImageRect;
use std::path::Path;

/// One wire to draw: layer index (colours cycle) and the polyline points.
pub struct DrawnRoute {
    pub layer: u16,
    pub points: Vec<Point>,
}

const LAYER_COLORS: [Rgb<u8>; 6] = [
    Rgb([70, 130, 220]),
    Rgb([220, 90, 70]),
    Rgb([90, 200, 120]),
    Rgb([200, 180, 60]),
    Rgb([170, 90, 210]),
    Rgb([80, 200, 200]),
];

/// Renders routed wires and via positions over the routing area.
pub fn draw_routes(
    area: Rect,
    routes: &[DrawnRoute],
    vias: &[Point],
    filename: &str,
    size: u32,
) {
    let w = size.max(200);
    let h = size.max(200);
    let mut img = RgbImage::from_pixel(w, h, Rgb([20, 20, 20]));

    let area_w = area.width().max(1) as f64;
    let area_h = area.height().max(1) as f64;
    let scale_x = w as f64 / area_w;
    let scale_y = h as f64 / area_h;

    let map = |p: Point| {
        (
            (p.x - area.lower_left().x) as f64 * scale_x,
            h as f64 - (p.y - area.lower_left().y) as f64 * scale_y,
        )
    };

    for route in routes {
        let color = LAYER_COLORS[route.layer as usize % LAYER_COLORS.len()];
        for pair in route.points.windows(2) {
            let (x0, y0) = map(pair[0]);
            let (x1, y1) = map(pair[1]);
            draw_line_segment_mut(&mut img, (x0 as f32, y0 as f32), (x1 as f32, y1 as f32), color);
        }
    }

    let via_color = Rgb([240, 240, 240]);
    for via in vias {
        let (x, y) = map(*via);
        let rect = ImageRect::at(x as i32 - 1, y as i32 - 1).of_size(3, 3);
        draw_filled_rect_mut(&mut img, rect, via_color);
    }

    if let Some(parent) = Path::new(filename).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let _ = img.save(Path::new(filename));
}
