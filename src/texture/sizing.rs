use glam::{UVec2, Vec2};

/// Smallest power of two that is `>= value`; zero rounds up to one.
pub fn next_pow2(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Largest power of two that is `<= value`, or zero for zero.
pub fn floor_pow2(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (31 - value.leading_zeros())
    }
}

/// Where rasterized content sits inside its power-of-two texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureLayout {
    pub content: UVec2,
    pub texture: UVec2,
    /// Uniform factor applied to the content and all of its metrics; `1.0` when it fit.
    pub scale: f32,
}

impl TextureLayout {
    /// Bottom-right corner of the content in normalized texture coordinates.
    pub fn uv_max(&self) -> Vec2 {
        self.content.as_vec2() / self.texture.as_vec2()
    }
}

/// Fits content of `size` pixels into a power-of-two texture no wider or taller than
/// `max_size`, which must itself be a power of two. Oversized content is scaled down by one
/// factor on both axes.
pub fn fit_content(size: Vec2, max_size: u32) -> TextureLayout {
    let max = max_size.max(1) as f32;
    let size = size.max(Vec2::ONE);
    let scale = (max / size.x).min(max / size.y).min(1.0);
    let scaled = if scale < 1.0 { (size * scale).round() } else { size.ceil() };
    let content = scaled.clamp(Vec2::ONE, Vec2::splat(max)).as_uvec2();
    let texture = UVec2::new(next_pow2(content.x), next_pow2(content.y));
    TextureLayout { content, texture, scale }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powers_of_two() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(64), 64);
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1000), 512);
        assert_eq!(floor_pow2(4096), 4096);
    }

    #[test]
    fn small_content_keeps_its_size() {
        let layout = fit_content(Vec2::new(30.2, 17.0), 256);
        assert_eq!(layout.content, UVec2::new(31, 17));
        assert_eq!(layout.texture, UVec2::new(32, 32));
        assert_eq!(layout.scale, 1.0);
    }

    #[test]
    fn oversized_content_is_scaled_uniformly() {
        let layout = fit_content(Vec2::new(100.0, 40.0), 64);
        assert!((layout.scale - 0.64).abs() < 1e-6);
        assert_eq!(layout.content, UVec2::new(64, 26));
        assert_eq!(layout.texture, UVec2::new(64, 32));
    }

    #[test]
    fn uv_area_matches_content_fraction() {
        for (w, h, max) in [(3.0, 5.0, 1024), (129.0, 1.0, 1024), (5000.0, 700.0, 2048)] {
            let layout = fit_content(Vec2::new(w, h), max);
            assert!(layout.texture.x.is_power_of_two() && layout.texture.y.is_power_of_two());
            assert!(layout.texture.x <= max && layout.texture.y <= max);
            let uv = layout.uv_max();
            let expected = (layout.content.x * layout.content.y) as f32 / (layout.texture.x * layout.texture.y) as f32;
            assert!((uv.x * uv.y - expected).abs() < 1e-5);
        }
    }
}
