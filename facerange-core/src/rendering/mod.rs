//! rendering — in-place frame annotation
//!
//! Hollow rectangles for face/eye boxes, and text labels blitted from a
//! built-in 5×7 bitmap font at fixed screen positions.  Everything draws
//! directly into the frame's RGB24 buffer; no copies are made.

use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::rect::Rect;

use crate::detection::FaceBox;
use crate::video::RgbFrame;

// ── Fixed overlay layout ─────────────────────────────────────────────────────

/// Screen positions for the status labels, independent of face position.
pub const DISPLAYED_FPS_POS: (i32, i32) = (10, 20);
pub const READ_FPS_POS: (i32, i32) = (10, 40);
pub const DISTANCE_POS: (i32, i32) = (10, 120);

pub const FACE_COLOR: [u8; 3] = [0, 0, 255];
pub const EYE_COLOR: [u8; 3] = [0, 255, 0];
pub const LABEL_COLOR: [u8; 3] = [255, 255, 255];
pub const DISTANCE_COLOR: [u8; 3] = [0, 0, 0];

pub const LABEL_SCALE: u32 = 1;
pub const DISTANCE_SCALE: u32 = 2;

// ── Boxes ────────────────────────────────────────────────────────────────────

/// Draw hollow bounding boxes onto a frame's RGB data in-place.
pub fn draw_boxes(frame: &mut RgbFrame, boxes: &[FaceBox], color: [u8; 3]) {
    // Build the image from the existing buffer — no clone; we write back in-place.
    let mut img: RgbImage =
        ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
            .expect("valid frame dimensions");

    for b in boxes {
        if b.width < 1.0 || b.height < 1.0 {
            continue;
        }
        let rect = Rect::at(b.x as i32, b.y as i32).of_size(b.width as u32, b.height as u32);
        imageproc::drawing::draw_hollow_rect_mut(&mut img, rect, Rgb(color));
    }

    frame.data = img.into_raw();
}

/// Draw a single hollow bounding box.
pub fn draw_box(frame: &mut RgbFrame, b: FaceBox, color: [u8; 3]) {
    draw_boxes(frame, std::slice::from_ref(&b), color);
}

// ── Labels ───────────────────────────────────────────────────────────────────

/// Blit `text` at `pos` (top-left corner), magnified by `scale`.  Characters
/// outside printable ASCII render as `?`; pixels past the frame edge are
/// clipped.
pub fn draw_label(frame: &mut RgbFrame, text: &str, pos: (i32, i32), scale: u32, color: [u8; 3]) {
    let scale = scale.max(1) as i32;
    let advance = (GLYPH_WIDTH as i32 + 1) * scale;
    let mut pen_x = pos.0;

    for ch in text.chars() {
        let glyph = glyph_for(ch);
        for (col, bits) in glyph.iter().enumerate() {
            for row in 0..8 {
                if bits >> row & 1 == 0 {
                    continue;
                }
                fill_block(
                    frame,
                    pen_x + col as i32 * scale,
                    pos.1 + row * scale,
                    scale,
                    color,
                );
            }
        }
        pen_x += advance;
    }
}

fn fill_block(frame: &mut RgbFrame, x: i32, y: i32, scale: i32, color: [u8; 3]) {
    for dy in 0..scale {
        for dx in 0..scale {
            let px = x + dx;
            let py = y + dy;
            if px < 0 || py < 0 || px >= frame.width as i32 || py >= frame.height as i32 {
                continue;
            }
            let base = (py as usize * frame.width as usize + px as usize) * 3;
            frame.data[base..base + 3].copy_from_slice(&color);
        }
    }
}

// ── Font ─────────────────────────────────────────────────────────────────────

const GLYPH_WIDTH: usize = 5;
const FIRST_GLYPH: usize = 0x20;

fn glyph_for(ch: char) -> &'static [u8; GLYPH_WIDTH] {
    let idx = (ch as usize)
        .checked_sub(FIRST_GLYPH)
        .filter(|i| *i < FONT_5X7.len())
        .unwrap_or('?' as usize - FIRST_GLYPH);
    &FONT_5X7[idx]
}

/// Classic 5×7 ASCII font, one byte per column, LSB at the top row.
/// Covers 0x20..=0x7F.
const FONT_5X7: [[u8; GLYPH_WIDTH]; 96] = [
    [0x00, 0x00, 0x00, 0x00, 0x00], // ' '
    [0x00, 0x00, 0x5F, 0x00, 0x00], // '!'
    [0x00, 0x07, 0x00, 0x07, 0x00], // '"'
    [0x14, 0x7F, 0x14, 0x7F, 0x14], // '#'
    [0x24, 0x2A, 0x7F, 0x2A, 0x12], // '$'
    [0x23, 0x13, 0x08, 0x64, 0x62], // '%'
    [0x36, 0x49, 0x55, 0x22, 0x50], // '&'
    [0x00, 0x05, 0x03, 0x00, 0x00], // '\''
    [0x00, 0x1C, 0x22, 0x41, 0x00], // '('
    [0x00, 0x41, 0x22, 0x1C, 0x00], // ')'
    [0x14, 0x08, 0x3E, 0x08, 0x14], // '*'
    [0x08, 0x08, 0x3E, 0x08, 0x08], // '+'
    [0x00, 0x50, 0x30, 0x00, 0x00], // ','
    [0x08, 0x08, 0x08, 0x08, 0x08], // '-'
    [0x00, 0x60, 0x60, 0x00, 0x00], // '.'
    [0x20, 0x10, 0x08, 0x04, 0x02], // '/'
    [0x3E, 0x51, 0x49, 0x45, 0x3E], // '0'
    [0x00, 0x42, 0x7F, 0x40, 0x00], // '1'
    [0x42, 0x61, 0x51, 0x49, 0x46], // '2'
    [0x21, 0x41, 0x45, 0x4B, 0x31], // '3'
    [0x18, 0x14, 0x12, 0x7F, 0x10], // '4'
    [0x27, 0x45, 0x45, 0x45, 0x39], // '5'
    [0x3C, 0x4A, 0x49, 0x49, 0x30], // '6'
    [0x01, 0x71, 0x09, 0x05, 0x03], // '7'
    [0x36, 0x49, 0x49, 0x49, 0x36], // '8'
    [0x06, 0x49, 0x49, 0x29, 0x1E], // '9'
    [0x00, 0x36, 0x36, 0x00, 0x00], // ':'
    [0x00, 0x56, 0x36, 0x00, 0x00], // ';'
    [0x08, 0x14, 0x22, 0x41, 0x00], // '<'
    [0x14, 0x14, 0x14, 0x14, 0x14], // '='
    [0x00, 0x41, 0x22, 0x14, 0x08], // '>'
    [0x02, 0x01, 0x51, 0x09, 0x06], // '?'
    [0x32, 0x49, 0x79, 0x41, 0x3E], // '@'
    [0x7E, 0x11, 0x11, 0x11, 0x7E], // 'A'
    [0x7F, 0x49, 0x49, 0x49, 0x36], // 'B'
    [0x3E, 0x41, 0x41, 0x41, 0x22], // 'C'
    [0x7F, 0x41, 0x41, 0x22, 0x1C], // 'D'
    [0x7F, 0x49, 0x49, 0x49, 0x41], // 'E'
    [0x7F, 0x09, 0x09, 0x09, 0x01], // 'F'
    [0x3E, 0x41, 0x49, 0x49, 0x7A], // 'G'
    [0x7F, 0x08, 0x08, 0x08, 0x7F], // 'H'
    [0x00, 0x41, 0x7F, 0x41, 0x00], // 'I'
    [0x20, 0x40, 0x41, 0x3F, 0x01], // 'J'
    [0x7F, 0x08, 0x14, 0x22, 0x41], // 'K'
    [0x7F, 0x40, 0x40, 0x40, 0x40], // 'L'
    [0x7F, 0x02, 0x0C, 0x02, 0x7F], // 'M'
    [0x7F, 0x04, 0x08, 0x10, 0x7F], // 'N'
    [0x3E, 0x41, 0x41, 0x41, 0x3E], // 'O'
    [0x7F, 0x09, 0x09, 0x09, 0x06], // 'P'
    [0x3E, 0x41, 0x51, 0x21, 0x5E], // 'Q'
    [0x7F, 0x09, 0x19, 0x29, 0x46], // 'R'
    [0x46, 0x49, 0x49, 0x49, 0x31], // 'S'
    [0x01, 0x01, 0x7F, 0x01, 0x01], // 'T'
    [0x3F, 0x40, 0x40, 0x40, 0x3F], // 'U'
    [0x1F, 0x20, 0x40, 0x20, 0x1F], // 'V'
    [0x3F, 0x40, 0x38, 0x40, 0x3F], // 'W'
    [0x63, 0x14, 0x08, 0x14, 0x63], // 'X'
    [0x07, 0x08, 0x70, 0x08, 0x07], // 'Y'
    [0x61, 0x51, 0x49, 0x45, 0x43], // 'Z'
    [0x00, 0x7F, 0x41, 0x41, 0x00], // '['
    [0x02, 0x04, 0x08, 0x10, 0x20], // '\\'
    [0x00, 0x41, 0x41, 0x7F, 0x00], // ']'
    [0x04, 0x02, 0x01, 0x02, 0x04], // '^'
    [0x40, 0x40, 0x40, 0x40, 0x40], // '_'
    [0x00, 0x01, 0x02, 0x04, 0x00], // '`'
    [0x20, 0x54, 0x54, 0x54, 0x78], // 'a'
    [0x7F, 0x48, 0x44, 0x44, 0x38], // 'b'
    [0x38, 0x44, 0x44, 0x44, 0x20], // 'c'
    [0x38, 0x44, 0x44, 0x48, 0x7F], // 'd'
    [0x38, 0x54, 0x54, 0x54, 0x18], // 'e'
    [0x08, 0x7E, 0x09, 0x01, 0x02], // 'f'
    [0x0C, 0x52, 0x52, 0x52, 0x3E], // 'g'
    [0x7F, 0x08, 0x04, 0x04, 0x78], // 'h'
    [0x00, 0x44, 0x7D, 0x40, 0x00], // 'i'
    [0x20, 0x40, 0x44, 0x3D, 0x00], // 'j'
    [0x7F, 0x10, 0x28, 0x44, 0x00], // 'k'
    [0x00, 0x41, 0x7F, 0x40, 0x00], // 'l'
    [0x7C, 0x04, 0x18, 0x04, 0x78], // 'm'
    [0x7C, 0x08, 0x04, 0x04, 0x78], // 'n'
    [0x38, 0x44, 0x44, 0x44, 0x38], // 'o'
    [0x7C, 0x14, 0x14, 0x14, 0x08], // 'p'
    [0x08, 0x14, 0x14, 0x18, 0x7C], // 'q'
    [0x7C, 0x08, 0x04, 0x04, 0x08], // 'r'
    [0x48, 0x54, 0x54, 0x54, 0x20], // 's'
    [0x04, 0x3F, 0x44, 0x40, 0x20], // 't'
    [0x3C, 0x40, 0x40, 0x20, 0x7C], // 'u'
    [0x1C, 0x20, 0x40, 0x20, 0x1C], // 'v'
    [0x3C, 0x40, 0x30, 0x40, 0x3C], // 'w'
    [0x44, 0x28, 0x10, 0x28, 0x44], // 'x'
    [0x0C, 0x50, 0x50, 0x50, 0x3C], // 'y'
    [0x44, 0x64, 0x54, 0x4C, 0x44], // 'z'
    [0x00, 0x08, 0x36, 0x41, 0x00], // '{'
    [0x00, 0x00, 0x7F, 0x00, 0x00], // '|'
    [0x00, 0x41, 0x36, 0x08, 0x00], // '}'
    [0x10, 0x08, 0x08, 0x10, 0x08], // '~'
    [0x00, 0x00, 0x00, 0x00, 0x00], // DEL (blank)
];

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame(width: u32, height: u32) -> RgbFrame {
        RgbFrame {
            data: vec![0; (width * height * 3) as usize],
            width,
            height,
            pts: 0,
        }
    }

    fn pixel(frame: &RgbFrame, x: u32, y: u32) -> [u8; 3] {
        let base = ((y * frame.width + x) * 3) as usize;
        [frame.data[base], frame.data[base + 1], frame.data[base + 2]]
    }

    #[test]
    fn draw_box_colors_the_perimeter() {
        let mut frame = blank_frame(16, 16);
        let b = FaceBox {
            x: 2.0,
            y: 3.0,
            width: 5.0,
            height: 4.0,
        };
        draw_box(&mut frame, b, FACE_COLOR);

        // Corners of the hollow rect carry the color; the interior does not.
        assert_eq!(pixel(&frame, 2, 3), FACE_COLOR);
        assert_eq!(pixel(&frame, 6, 3), FACE_COLOR);
        assert_eq!(pixel(&frame, 2, 6), FACE_COLOR);
        assert_eq!(pixel(&frame, 4, 5), [0, 0, 0]);
    }

    #[test]
    fn degenerate_boxes_are_skipped() {
        let mut frame = blank_frame(8, 8);
        let b = FaceBox {
            x: 1.0,
            y: 1.0,
            width: 0.0,
            height: 0.0,
        };
        draw_box(&mut frame, b, FACE_COLOR);
        assert!(frame.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn draw_label_writes_glyph_pixels() {
        let mut frame = blank_frame(64, 16);
        draw_label(&mut frame, "1.5m", (2, 2), 1, LABEL_COLOR);
        let lit = frame
            .data
            .chunks_exact(3)
            .filter(|px| *px == LABEL_COLOR)
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn draw_label_clips_at_frame_edges() {
        let mut frame = blank_frame(10, 10);
        // Deliberately overruns the right and bottom edges.
        draw_label(&mut frame, "WWWW", (6, 8), 2, LABEL_COLOR);
        assert_eq!(frame.data.len(), 10 * 10 * 3);
    }
}
