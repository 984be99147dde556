use glam::Vec3;
use image::{Luma, Rgb, Rgb32FImage};
use serde::{Deserialize, Serialize};

use mf_core::buffers::{DepthMap, RenderBuffers, DEPTH_SENTINEL};
use mf_core::error::RenderFailure;
use mf_core::mask::Mask;
use mf_core::scene::{MirrorPose, SceneDescriptor};
use mf_data::renderer::SceneRenderer;

use crate::geometry::{intersect_box, intersect_floor, intersect_mirror, intersect_sphere, Hit, Ray};

/// Object shapes the ray caster knows how to draw
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Asset {
    Sphere,
    Cube,
    Pillar,
}

impl Asset {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sphere" => Some(Self::Sphere),
            "cube" => Some(Self::Cube),
            "pillar" => Some(Self::Pillar),
            _ => None,
        }
    }

    fn albedo(self) -> Vec3 {
        match self {
            Self::Sphere => Vec3::new(0.85, 0.25, 0.2),
            Self::Cube => Vec3::new(0.2, 0.4, 0.85),
            Self::Pillar => Vec3::new(0.9, 0.85, 0.7),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RayCastConfig {
    /// Mirror-to-mirror bounces followed before giving up
    pub max_bounces: u32,
    pub mirror_reflectance: f32,
    /// Half size of the square floor
    pub floor_extent: f32,
    pub shadows: bool,
}

impl Default for RayCastConfig {
    fn default() -> Self {
        Self {
            max_bounces: 6,
            mirror_reflectance: 0.92,
            floor_extent: 6.0,
            shadows: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Surface {
    Object,
    Floor,
    MirrorFront(usize),
    MirrorBack,
}

/// CPU ray caster for dual-mirror scenes.
///
/// Depth is the unfolded optical path length: for pixels that see a mirror it
/// is the distance travelled until the reflected ray lands on diffuse
/// geometry, and the sentinel when it escapes the scene.
#[derive(Clone, Debug, Default)]
pub struct RayCastRenderer {
    config: RayCastConfig,
}

struct SceneView<'a> {
    scene: &'a SceneDescriptor,
    asset: Asset,
    mirrors: [&'a MirrorPose; 2],
    config: &'a RayCastConfig,
}

impl RayCastRenderer {
    pub fn new(config: RayCastConfig) -> Self {
        Self { config }
    }
}

impl SceneRenderer for RayCastRenderer {
    fn render(&self, scene: &SceneDescriptor) -> Result<RenderBuffers, RenderFailure> {
        let asset = Asset::from_name(&scene.object.asset)
            .ok_or_else(|| RenderFailure::AssetMissing(scene.object.asset.clone()))?;
        if !scene.camera.is_valid() {
            return Err(RenderFailure::DegenerateGeometry("invalid camera".into()));
        }
        if scene.mirror_a.area() <= 0.0 || scene.mirror_b.area() <= 0.0 {
            return Err(RenderFailure::DegenerateGeometry("zero-area mirror".into()));
        }

        let view = SceneView {
            scene,
            asset,
            mirrors: [&scene.mirror_a, &scene.mirror_b],
            config: &self.config,
        };

        let (w, h) = (scene.camera.width, scene.camera.height);
        let mut rgb = Rgb32FImage::new(w, h);
        let mut depth = DepthMap::new(w, h);
        let mut mirror_mask_a = Mask::new(w, h);
        let mut mirror_mask_b = Mask::new(w, h);

        for y in 0..h {
            for x in 0..w {
                let ray = Ray::new(scene.camera.position, scene.camera.ray_direction(x, y));
                let sample = view.trace(ray);
                rgb.put_pixel(x, y, Rgb(sample.color.to_array()));
                depth.put_pixel(x, y, Luma([sample.depth]));
                match sample.first_mirror {
                    Some(0) => mirror_mask_a.set(x, y, true),
                    Some(_) => mirror_mask_b.set(x, y, true),
                    None => {}
                }
            }
        }

        log::debug!("Rendered {} ({}x{})", scene.scene_id, w, h);
        Ok(RenderBuffers {
            rgb,
            depth,
            mirror_mask_a,
            mirror_mask_b,
        })
    }

    fn name(&self) -> &str {
        "raycast"
    }
}

struct Sample {
    color: Vec3,
    depth: f32,
    first_mirror: Option<usize>,
}

impl SceneView<'_> {
    fn trace(&self, mut ray: Ray) -> Sample {
        let mut path = 0.0;
        let mut throughput = Vec3::ONE;
        let mut first_mirror = None;

        for bounce in 0..=self.config.max_bounces {
            let Some((hit, surface)) = self.closest(&ray) else {
                return Sample {
                    color: throughput * sky(ray.direction),
                    depth: DEPTH_SENTINEL,
                    first_mirror,
                };
            };
            path += hit.t;
            let point = ray.at(hit.t);

            if let (0, Surface::MirrorFront(i)) = (bounce, surface) {
                first_mirror = Some(i);
            }

            match surface {
                Surface::MirrorFront(_) if bounce < self.config.max_bounces => {
                    throughput *= self.config.mirror_reflectance;
                    ray = ray.reflect(point, hit.normal);
                }
                Surface::MirrorFront(_) => break,
                _ => {
                    return Sample {
                        color: throughput * self.shade(point, hit.normal, surface),
                        depth: path,
                        first_mirror,
                    };
                }
            }
        }

        // bounce budget exhausted between facing mirrors
        Sample {
            color: Vec3::ZERO,
            depth: DEPTH_SENTINEL,
            first_mirror,
        }
    }

    fn closest(&self, ray: &Ray) -> Option<(Hit, Surface)> {
        let mut best: Option<(Hit, Surface)> = None;
        let mut consider = |candidate: Option<Hit>, surface: Surface| {
            if let Some(hit) = candidate {
                if best.map_or(true, |(b, _)| hit.t < b.t) {
                    best = Some((hit, surface));
                }
            }
        };

        consider(self.intersect_object(ray), Surface::Object);
        consider(intersect_floor(ray, self.config.floor_extent), Surface::Floor);
        for (i, mirror) in self.mirrors.iter().enumerate() {
            if let Some((hit, front)) = intersect_mirror(ray, mirror) {
                let surface = if front { Surface::MirrorFront(i) } else { Surface::MirrorBack };
                consider(Some(hit), surface);
            }
        }
        best
    }

    fn intersect_object(&self, ray: &Ray) -> Option<Hit> {
        let object = &self.scene.object;
        match self.asset {
            Asset::Sphere => intersect_sphere(ray, object.position, object.scale),
            Asset::Cube => intersect_box(ray, object.position, Vec3::splat(object.scale), object.yaw),
            Asset::Pillar => intersect_box(
                ray,
                object.position + Vec3::new(0.0, object.scale, 0.0),
                Vec3::new(object.scale * 0.4, object.scale * 2.0, object.scale * 0.4),
                object.yaw,
            ),
        }
    }

    fn shade(&self, point: Vec3, normal: Vec3, surface: Surface) -> Vec3 {
        let albedo = match surface {
            Surface::Object => self.asset.albedo(),
            Surface::Floor => {
                let checker = ((point.x * 2.0).floor() + (point.z * 2.0).floor()) as i64 & 1;
                if checker == 0 { Vec3::splat(0.8) } else { Vec3::splat(0.35) }
            }
            _ => Vec3::splat(0.15),
        };

        let lighting = &self.scene.lighting;
        let to_light = -lighting.direction.normalize_or_zero();
        let mut diffuse = normal.dot(to_light).max(0.0);
        if diffuse > 0.0 && self.config.shadows {
            let shadow = Ray::new(point + normal * 1e-3, to_light);
            let blocked = self.intersect_object(&shadow).is_some()
                || self.mirrors.iter().any(|m| intersect_mirror(&shadow, m).is_some());
            if blocked {
                diffuse = 0.0;
            }
        }

        albedo * (lighting.ambient + lighting.intensity * diffuse)
    }
}

fn sky(direction: Vec3) -> Vec3 {
    let t = (direction.y * 0.5 + 0.5).clamp(0.0, 1.0);
    Vec3::new(0.95, 0.95, 0.95).lerp(Vec3::new(0.55, 0.7, 0.95), t)
}
