use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use mf_core::camera::CameraPose;
use mf_core::scene::{LightingConfig, MirrorPose, ObjectPlacement, SceneDescriptor};

use crate::index::splitmix64;

/// Ranges the procedural scene generator draws from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSamplerConfig {
    /// Object assets to choose from
    pub assets: Vec<String>,
    pub image_width: u32,
    pub image_height: u32,
    pub fov_y: f32,
    pub camera_distance: (f32, f32),
    pub camera_height: (f32, f32),
    pub object_scale: (f32, f32),
    pub mirror_width: (f32, f32),
    pub mirror_height: (f32, f32),
    /// Distance of each mirror behind the object
    pub mirror_depth: (f32, f32),
    /// Horizontal offset of each mirror from the scene center
    pub mirror_spread: (f32, f32),
    /// Extra rotation of each mirror about the up axis, degrees
    pub mirror_yaw_jitter: f32,
}

impl Default for SceneSamplerConfig {
    fn default() -> Self {
        Self {
            assets: vec!["sphere".into(), "cube".into(), "pillar".into()],
            image_width: 256,
            image_height: 256,
            fov_y: 50.0,
            camera_distance: (3.0, 4.5),
            camera_height: (1.4, 2.0),
            object_scale: (0.3, 0.6),
            mirror_width: (0.8, 1.4),
            mirror_height: (0.9, 1.5),
            mirror_depth: (0.8, 1.6),
            mirror_spread: (0.6, 1.2),
            mirror_yaw_jitter: 15.0,
        }
    }
}

/// Seeded generator of dual-mirror scene descriptors.
///
/// `descriptor(i)` depends only on the sampler seed and `i`, so descriptors can
/// be produced out of order on any worker.
#[derive(Clone, Debug)]
pub struct SceneSampler {
    config: SceneSamplerConfig,
    seed: u64,
}

impl SceneSampler {
    pub fn new(config: SceneSamplerConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    pub fn config(&self) -> &SceneSamplerConfig {
        &self.config
    }

    pub fn descriptor(&self, index: u64) -> SceneDescriptor {
        let mut rng = StdRng::seed_from_u64(splitmix64(self.seed ^ splitmix64(index)));
        let c = &self.config;

        let asset = if c.assets.is_empty() {
            String::new()
        } else {
            c.assets[rng.gen_range(0..c.assets.len())].clone()
        };
        let scale = uniform(&mut rng, c.object_scale);
        let object = ObjectPlacement {
            asset,
            position: Vec3::new(rng.gen_range(-0.3..=0.3), scale, rng.gen_range(-0.3..=0.3)),
            scale,
            yaw: rng.gen_range(0.0..std::f32::consts::TAU),
        };

        let distance = uniform(&mut rng, c.camera_distance);
        let azimuth = rng.gen_range(-25.0f32..=25.0).to_radians();
        let camera = CameraPose {
            position: Vec3::new(
                distance * azimuth.sin(),
                uniform(&mut rng, c.camera_height),
                distance * azimuth.cos(),
            ),
            target: Vec3::new(0.0, 0.7, -0.5),
            up: Vec3::Y,
            fov_y: c.fov_y,
            width: c.image_width,
            height: c.image_height,
            ..CameraPose::default()
        };

        // Mirrors stand on either side behind the object, turned toward the
        // point between object and camera so each can see the other.
        let focus = (object.position + camera.position) * 0.5;
        let mirror = |side: f32, rng: &mut StdRng| {
            let height = uniform(rng, c.mirror_height);
            let center = Vec3::new(
                side * uniform(rng, c.mirror_spread),
                height * 0.5 + 0.05,
                -uniform(rng, c.mirror_depth),
            );
            let to_focus = Vec3::new(focus.x - center.x, 0.0, focus.z - center.z).normalize_or_zero();
            let limit = c.mirror_yaw_jitter.abs();
            let jitter = rng.gen_range(-limit..=limit).to_radians();
            let (sin, cos) = jitter.sin_cos();
            let normal = Vec3::new(
                to_focus.x * cos - to_focus.z * sin,
                0.0,
                to_focus.x * sin + to_focus.z * cos,
            );
            MirrorPose {
                center,
                normal,
                up: Vec3::Y,
                width: uniform(rng, c.mirror_width),
                height,
            }
        };
        let mirror_a = mirror(-1.0, &mut rng);
        let mirror_b = mirror(1.0, &mut rng);

        let elevation = rng.gen_range(35.0f32..=70.0).to_radians();
        let light_azimuth = rng.gen_range(0.0..std::f32::consts::TAU);
        let lighting = LightingConfig {
            direction: -Vec3::new(
                elevation.cos() * light_azimuth.sin(),
                elevation.sin(),
                elevation.cos() * light_azimuth.cos(),
            ),
            intensity: rng.gen_range(0.7..=1.0),
            ambient: rng.gen_range(0.1..=0.25),
        };

        SceneDescriptor {
            scene_id: format!("scene-{:016x}-{:06}", self.seed, index),
            object,
            mirror_a,
            mirror_b,
            camera,
            lighting,
        }
    }
}

fn uniform(rng: &mut StdRng, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}
