//! Synthetic room photos and billing accounts for pipeline tests

#![allow(dead_code)]

use image::{GrayImage, ImageFormat, Luma};
use realenhance_pipeline::models::reservation::{AgencyAccount, PlanTier};
use std::io::Cursor;

const BACKGROUND: u8 = 200;
const FRAME: u8 = 40;

/// Window and door frames on a plain wall.
pub fn room() -> GrayImage {
    let mut img = GrayImage::from_pixel(320, 240, Luma([BACKGROUND]));
    for (x0, x1, y0, y1) in [(30, 90, 40, 200), (140, 170, 60, 120), (220, 290, 30, 180)] {
        for y in y0..y1 {
            for x in x0..x1 {
                img.put_pixel(x, y, Luma([FRAME]));
            }
        }
    }
    img
}

/// The room with every frame moved, as a model that redrew the walls would.
pub fn moved_room() -> GrayImage {
    let base = room();
    let (dx, dy) = (40, 35);
    let mut out = GrayImage::from_pixel(base.width(), base.height(), Luma([BACKGROUND]));
    for (x, y, p) in base.enumerate_pixels() {
        if x + dx < base.width() && y + dy < base.height() {
            out.put_pixel(x + dx, y + dy, *p);
        }
    }
    out
}

pub fn png(img: &GrayImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .expect("PNG encoding failed");
    buf.into_inner()
}

pub fn room_png() -> Vec<u8> {
    png(&room())
}

pub fn moved_room_png() -> Vec<u8> {
    png(&moved_room())
}

pub const AGENCY: &str = "agency-harbor";

/// Account with a small included allowance so quota edges are easy to reach.
pub fn account(included_limit: i32, addon_balance: i32) -> AgencyAccount {
    AgencyAccount {
        agency_id: AGENCY.to_string(),
        plan_tier: PlanTier::Starter,
        included_limit_override: Some(included_limit),
        addon_balance,
    }
}
