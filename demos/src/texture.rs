//! Procedural texture data.

/// Generate a `size`x`size` RGBA8 checkerboard with `cell`-texel squares.
///
/// Light squares are tinted so mip levels stay distinguishable from grey.
pub fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let texel = if light {
                [240, 200, 120, 255]
            } else {
                [40, 40, 60, 255]
            };
            data.extend_from_slice(&texel);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_size() {
        assert_eq!(checkerboard(64, 8).len(), 64 * 64 * 4);
    }

    #[test]
    fn test_checkerboard_alternates() {
        let data = checkerboard(16, 4);
        let texel = |x: usize, y: usize| &data[(y * 16 + x) * 4..(y * 16 + x) * 4 + 4];
        assert_eq!(texel(0, 0), texel(8, 0));
        assert_ne!(texel(0, 0), texel(4, 0));
        assert_ne!(texel(0, 0), texel(0, 4));
    }

    #[test]
    fn test_zero_cell_is_clamped() {
        assert_eq!(checkerboard(4, 0).len(), 4 * 4 * 4);
    }
}
