use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::camera::CameraPose;
use crate::error::DataGenerationError;

/// Planar rectangular mirror
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorPose {
    pub center: Vec3,
    /// Reflective side faces along the normal
    pub normal: Vec3,
    /// In-plane vertical axis
    pub up: Vec3,
    pub width: f32,
    pub height: f32,
}

impl MirrorPose {
    /// Orthonormal in-plane axes `(right, up)`
    pub fn axes(&self) -> (Vec3, Vec3) {
        let normal = self.normal.normalize_or_zero();
        let right = self.up.cross(normal).normalize_or_zero();
        let up = normal.cross(right);
        (right, up)
    }

    pub fn area(&self) -> f32 {
        let (right, up) = self.axes();
        if right == Vec3::ZERO || up == Vec3::ZERO {
            return 0.0;
        }
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Point on the mirror at normalized coordinates `(s, t)` in `[-1, 1]`
    pub fn point(&self, s: f32, t: f32) -> Vec3 {
        let (right, up) = self.axes();
        self.center + right * (s * self.width * 0.5) + up * (t * self.height * 0.5)
    }

    pub fn corners(&self) -> [Vec3; 4] {
        [
            self.point(-1.0, -1.0),
            self.point(1.0, -1.0),
            self.point(1.0, 1.0),
            self.point(-1.0, 1.0),
        ]
    }
}

/// Placement of one object asset in the scene
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectPlacement {
    pub asset: String,
    pub position: Vec3,
    pub scale: f32,
    /// Rotation about the world up axis, radians
    pub yaw: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LightingConfig {
    /// Direction the light travels
    pub direction: Vec3,
    pub intensity: f32,
    pub ambient: f32,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.4, -1.0, -0.6).normalize(),
            intensity: 0.9,
            ambient: 0.15,
        }
    }
}

/// Declarative description of one dual-mirror scene. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub scene_id: String,
    pub object: ObjectPlacement,
    pub mirror_a: MirrorPose,
    pub mirror_b: MirrorPose,
    pub camera: CameraPose,
    pub lighting: LightingConfig,
}

/// Thresholds deciding when a descriptor is degenerate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPolicy {
    /// Smallest accepted mirror area in square scene units
    pub min_mirror_area: f32,
    /// Samples per side of the grid used for the frustum test
    pub frustum_samples: u32,
}

impl Default for DescriptorPolicy {
    fn default() -> Self {
        Self {
            min_mirror_area: 1e-3,
            frustum_samples: 5,
        }
    }
}

impl SceneDescriptor {
    /// Reject descriptors that cannot produce a grounded reflection.
    pub fn validate(&self, policy: &DescriptorPolicy) -> Result<(), DataGenerationError> {
        if !self.camera.is_valid() {
            return Err(DataGenerationError::DegenerateScene(format!(
                "{}: invalid camera pose",
                self.scene_id
            )));
        }

        for (name, mirror) in [("A", &self.mirror_a), ("B", &self.mirror_b)] {
            let area = mirror.area();
            if !(area > policy.min_mirror_area) {
                return Err(DataGenerationError::DegenerateScene(format!(
                    "{}: mirror {} area {:.5} below {:.5}",
                    self.scene_id, name, area, policy.min_mirror_area
                )));
            }
        }

        if !self.mirror_in_view(&self.mirror_a, policy) && !self.mirror_in_view(&self.mirror_b, policy) {
            return Err(DataGenerationError::DegenerateScene(format!(
                "{}: no mirror intersects the camera frustum",
                self.scene_id
            )));
        }

        Ok(())
    }

    fn mirror_in_view(&self, mirror: &MirrorPose, policy: &DescriptorPolicy) -> bool {
        let n = policy.frustum_samples.max(2);
        (0..n).any(|i| {
            (0..n).any(|j| {
                let s = i as f32 / (n - 1) as f32 * 2.0 - 1.0;
                let t = j as f32 / (n - 1) as f32 * 2.0 - 1.0;
                self.camera.sees(mirror.point(s, t))
            })
        })
    }
}
