#[cfg(test)]
mod tests {
    use glam::Vec3;

    use mf_core::buffers::is_sentinel;
    use mf_core::camera::CameraPose;
    use mf_core::error::RenderFailure;
    use mf_core::scene::{LightingConfig, MirrorPose, ObjectPlacement, SceneDescriptor};
    use mf_data::renderer::SceneRenderer;
    use mf_data::sampler::{SceneSampler, SceneSamplerConfig};

    use crate::geometry::{intersect_box, intersect_sphere, Ray};
    use crate::renderer::{RayCastConfig, RayCastRenderer};

    fn corridor_scene() -> SceneDescriptor {
        SceneDescriptor {
            scene_id: "corridor".into(),
            object: ObjectPlacement {
                asset: "cube".into(),
                position: Vec3::new(1.2, 0.3, 1.0),
                scale: 0.3,
                yaw: 0.4,
            },
            mirror_a: MirrorPose {
                center: Vec3::new(0.0, 0.8, -1.0),
                normal: Vec3::Z,
                up: Vec3::Y,
                width: 2.0,
                height: 1.2,
            },
            mirror_b: MirrorPose {
                center: Vec3::new(5.0, 0.8, 0.0),
                normal: -Vec3::X,
                up: Vec3::Y,
                width: 1.0,
                height: 1.2,
            },
            camera: CameraPose {
                position: Vec3::new(0.0, 1.5, 4.0),
                target: Vec3::new(0.0, 0.8, 0.0),
                width: 33,
                height: 33,
                ..CameraPose::default()
            },
            lighting: LightingConfig::default(),
        }
    }

    #[test]
    fn test_sphere_and_box_hits() {
        let ray = Ray::new(Vec3::new(0.0, 0.0, 5.0), -Vec3::Z);

        let sphere = intersect_sphere(&ray, Vec3::ZERO, 1.0).unwrap();
        assert!((sphere.t - 4.0).abs() < 1e-5);
        assert!((sphere.normal - Vec3::Z).length() < 1e-5);

        let cube = intersect_box(&ray, Vec3::ZERO, Vec3::splat(0.5), 0.0).unwrap();
        assert!((cube.t - 4.5).abs() < 1e-5);
        assert!(intersect_box(&ray, Vec3::new(3.0, 0.0, 0.0), Vec3::splat(0.5), 0.0).is_none());
    }

    #[test]
    fn test_reflection_depth_and_masks() {
        let scene = corridor_scene();
        let buffers = RayCastRenderer::default().render(&scene).unwrap();

        assert!(buffers.check_shapes().is_ok());
        // the center ray hits mirror A and the reflection lands on the floor
        assert!(buffers.mirror_mask_a.get(16, 16));
        assert!(!buffers.mirror_mask_b.get(16, 16));
        let center_depth = buffers.depth.get_pixel(16, 16).0[0];
        assert!(center_depth.is_finite());
        assert!(center_depth > 5.0);

        // the top row looks over the mirror into the sky
        assert!(is_sentinel(buffers.depth.get_pixel(16, 0).0[0]));
        assert!(!buffers.mirror_mask_a.get(16, 0));
    }

    #[test]
    fn test_masks_without_bounce_budget() {
        let scene = corridor_scene();
        let renderer = RayCastRenderer::new(RayCastConfig {
            max_bounces: 0,
            ..RayCastConfig::default()
        });
        let buffers = renderer.render(&scene).unwrap();
        let reference = RayCastRenderer::default().render(&scene).unwrap();

        assert_eq!(buffers.mirror_mask_a, reference.mirror_mask_a);
        assert_eq!(buffers.mirror_mask_b, reference.mirror_mask_b);
        // the reflection itself is not followed
        assert!(is_sentinel(buffers.depth.get_pixel(16, 16).0[0]));
    }

    #[test]
    fn test_unknown_asset_fails() {
        let mut scene = corridor_scene();
        scene.object.asset = "teapot".into();

        let result = RayCastRenderer::default().render(&scene);
        assert_eq!(result.unwrap_err(), RenderFailure::AssetMissing("teapot".into()));
    }

    #[test]
    fn test_sampled_scenes_show_mirrors() {
        let config = SceneSamplerConfig {
            image_width: 48,
            image_height: 48,
            ..SceneSamplerConfig::default()
        };
        let sampler = SceneSampler::new(config, 1);
        let renderer = RayCastRenderer::default();

        let mut mirror_pixels = 0;
        for i in 0..4 {
            let buffers = renderer.render(&sampler.descriptor(i)).unwrap();
            let overlap = buffers
                .mirror_mask_a
                .as_slice()
                .iter()
                .zip(buffers.mirror_mask_b.as_slice())
                .any(|(&a, &b)| a && b);
            assert!(!overlap);
            mirror_pixels += buffers.mirror_mask_a.count() + buffers.mirror_mask_b.count();
        }
        assert!(mirror_pixels > 0);
    }
}
