//! Diagnostic overlay rendering.
//!
//! `render_overlay` is a pure transform from a raw frame plus the pipeline's
//! view of the current decision to an annotated RGB image.

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut},
    rect::Rect,
};
use pose_core::{PoseLandmarks, SKELETON};
use video_ingest::Frame;

use crate::monitor::encoding::frame_to_image;

const LIMB: Rgb<u8> = Rgb([0, 255, 0]);
const JOINT: Rgb<u8> = Rgb([255, 0, 0]);
const WARNING: Rgb<u8> = Rgb([255, 165, 0]);
const ALARM: Rgb<u8> = Rgb([255, 0, 0]);
const OK: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const BACKDROP: Rgb<u8> = Rgb([0, 0, 0]);

const BORDER_THICKNESS: u32 = 10;
const STATUS_DOT_RADIUS: i32 = 10;

/// Counter progress shown while candidate frames accumulate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CandidateBadge {
    pub(crate) count: u32,
    pub(crate) threshold: u32,
    pub(crate) confidence: f32,
}

/// Everything drawn on top of a frame.
pub(crate) struct Overlay<'a> {
    pub(crate) session_label: &'a str,
    pub(crate) fps: f32,
    pub(crate) candidate: Option<CandidateBadge>,
    /// Confidence shown in the alarm banner; `None` when no fall is active.
    pub(crate) alarm: Option<f32>,
    pub(crate) skeleton: Option<&'a PoseLandmarks>,
}

pub(crate) fn render_overlay(frame: &Frame, overlay: &Overlay<'_>) -> Result<RgbImage> {
    let mut image = frame_to_image(frame)?;
    let (width, height) = image.dimensions();

    if let Some(landmarks) = overlay.skeleton {
        draw_skeleton(&mut image, landmarks);
    }

    if let Some(badge) = overlay.candidate {
        let text = format!(
            "POSSIBLE FALL {}/{} ({:.1}%)",
            badge.count, badge.threshold, badge.confidence
        );
        draw_text_box(&mut image, 10, 30, &text, WARNING, 2);
    }

    if let Some(confidence) = overlay.alarm {
        let text = format!("FALL DETECTED! ({confidence:.0}%)");
        draw_text_box(&mut image, 10, 80, &text, ALARM, 3);
        draw_border(&mut image, ALARM, BORDER_THICKNESS);
    }

    let footer = format!("SESSION {} | FPS {:.0}", overlay.session_label, overlay.fps);
    let footer_y = height as i32 - 10 - glyph_height(2);
    draw_text_box(&mut image, 10, footer_y, &footer, TEXT, 2);

    let dot_color = if overlay.alarm.is_some() { ALARM } else { OK };
    draw_filled_circle_mut(
        &mut image,
        (width as i32 - 30, 30),
        STATUS_DOT_RADIUS,
        dot_color,
    );

    Ok(image)
}

fn draw_skeleton(image: &mut RgbImage, landmarks: &PoseLandmarks) {
    let (width, height) = image.dimensions();
    let to_px = |x: f32, y: f32| (x * width as f32, y * height as f32);

    for (from, to) in SKELETON {
        if let (Some(a), Some(b)) = (landmarks.get(from), landmarks.get(to)) {
            draw_line_segment_mut(image, to_px(a.x, a.y), to_px(b.x, b.y), LIMB);
        }
    }
    for (_, point) in landmarks.iter() {
        let (x, y) = to_px(point.x, point.y);
        draw_filled_circle_mut(image, (x.round() as i32, y.round() as i32), 3, JOINT);
    }
}

fn draw_border(image: &mut RgbImage, color: Rgb<u8>, thickness: u32) {
    let (width, height) = image.dimensions();
    let t = thickness.min(width / 2).min(height / 2).max(1);
    let edges = [
        Rect::at(0, 0).of_size(width, t),
        Rect::at(0, (height - t) as i32).of_size(width, t),
        Rect::at(0, 0).of_size(t, height),
        Rect::at((width - t) as i32, 0).of_size(t, height),
    ];
    for edge in edges {
        draw_filled_rect_mut(image, edge, color);
    }
}

fn glyph_height(scale: u32) -> i32 {
    7 * scale as i32
}

fn text_width(text: &str, scale: u32) -> i32 {
    text.chars().count() as i32 * 6 * scale as i32
}

fn draw_text_box(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: u32) {
    let pad = 2 * scale as i32;
    let left = (x - pad).max(0);
    let top = (y - pad).max(0);
    let box_width = (text_width(text, scale) + 2 * pad).max(1) as u32;
    let box_height = (glyph_height(scale) + 2 * pad).max(1) as u32;
    draw_filled_rect_mut(
        image,
        Rect::at(left, top).of_size(box_width, box_height),
        BACKDROP,
    );
    draw_label(image, x, y, text, color, scale);
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: u32) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let scale = scale.max(1) as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        let glyph = glyph_bits(ch).unwrap_or(UNKNOWN_GLYPH);
        for (row, pattern) in glyph.iter().enumerate() {
            for col in 0..5 {
                if (pattern >> (4 - col)) & 1 == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = x + col * scale + dx;
                        let py = y + row as i32 * scale + dy;
                        if px >= 0 && px < width && py >= 0 && py < height {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += 6 * scale;
    }
}

const UNKNOWN_GLYPH: [u8; 7] = [
    0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100,
];

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '|' => [0b00100; 7],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
