use glam::{Mat4, Vec3, Vec4Swizzles};
use serde::{Deserialize, Serialize};

/// Pinhole camera pose for one rendered view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees
    pub fov_y: f32,
    pub width: u32,
    pub height: u32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.0, 4.0),
            target: Vec3::new(0.0, 1.0, 0.0),
            up: Vec3::Y,
            fov_y: 50.0,
            width: 256,
            height: 256,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl CameraPose {
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(
            self.fov_y.to_radians(),
            self.aspect_ratio(),
            self.near,
            self.far,
        )
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// World-space direction of the ray through the center of pixel `(x, y)`
    pub fn ray_direction(&self, x: u32, y: u32) -> Vec3 {
        let forward = self.forward();
        let right = forward.cross(self.up).normalize_or_zero();
        let up = right.cross(forward);

        let half_h = (self.fov_y.to_radians() * 0.5).tan();
        let half_w = half_h * self.aspect_ratio();

        let u = ((x as f32 + 0.5) / self.width as f32) * 2.0 - 1.0;
        let v = 1.0 - ((y as f32 + 0.5) / self.height as f32) * 2.0;

        (forward + right * (u * half_w) + up * (v * half_h)).normalize()
    }

    /// Whether a world-space point lies inside the view frustum
    pub fn sees(&self, point: Vec3) -> bool {
        let clip = self.view_projection_matrix() * point.extend(1.0);
        if clip.w <= 0.0 {
            return false;
        }
        let ndc = clip.xyz() / clip.w;
        ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0 && (0.0..=1.0).contains(&ndc.z)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.fov_y > 0.0
            && self.fov_y < 180.0
            && self.near > 0.0
            && self.far > self.near
            && (self.target - self.position).length_squared() > 0.0
            && self.forward().cross(self.up).length_squared() > 1e-8
    }
}
