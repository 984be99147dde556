#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use burn::backend::Autodiff;
    use burn::module::Module;
    use burn::prelude::Backend;
    use burn::Tensor;
    use burn_ndarray::NdArray;
    use image::{Luma, Rgb, Rgb32FImage};

    use mf_core::buffers::{DepthMap, RenderBuffers};
    use mf_core::error::{Error, InferenceError, TrainingError};
    use mf_core::mask::Mask;
    use mf_core::record::{blank_masked, DepthNormalizationConfig, RecordId};
    use mf_data::builder::RecordBuilder;
    use mf_data::index::DatasetIndex;

    use crate::checkpoint::{backbone_fingerprint, Checkpoint, CheckpointStore};
    use crate::model::{InpaintModel, InpaintModelConfig, TrainingMode};
    use crate::sampler::{Sampler, SamplerConfig};
    use crate::schedule::NoiseScheduleConfig;
    use crate::train::{masked_mse, TrainingConfig, TrainingData};

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mf-diffusion-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn tiny_config() -> InpaintModelConfig {
        InpaintModelConfig::new()
            .with_patch_size(2)
            .with_hidden_channels(8)
            .with_adapter_channels(4)
            .with_norm_groups(2)
            .with_time_embed_dim(8)
            .with_context_dim(6)
            .with_attention_heads(2)
    }

    fn mirror_mask() -> Mask {
        Mask::from_fn(16, 16, |x, y| (4..10).contains(&x) && (5..11).contains(&y))
    }

    fn scene_image(shift: u32) -> Rgb32FImage {
        Rgb32FImage::from_fn(16, 16, |x, y| {
            Rgb([((x + shift) % 16) as f32 / 16.0, y as f32 / 16.0, 0.4])
        })
    }

    fn scene_depth() -> DepthMap {
        DepthMap::from_fn(16, 16, |x, y| Luma([2.0 + (x + y) as f32 * 0.1]))
    }

    fn dataset(name: &str, count: u32) -> (PathBuf, DatasetIndex, Vec<RecordId>) {
        let dir = temp_dir(name);
        let index = DatasetIndex::open(dir.join("dataset")).unwrap();
        for i in 0..count {
            let buffers = RenderBuffers {
                rgb: scene_image(i),
                depth: scene_depth(),
                mirror_mask_a: mirror_mask(),
                mirror_mask_b: Mask::new(16, 16),
            };
            let record = RecordBuilder::default().build(format!("scene-{}", i), buffers).unwrap();
            index.add(&record).unwrap();
        }
        let ids = index.ids();
        (dir, index, ids)
    }

    fn training_config(mode: TrainingMode, steps: usize) -> TrainingConfig {
        TrainingConfig::new(mode)
            .with_num_steps(steps)
            .with_batch_size(2)
            .with_checkpoint_interval(1)
            .with_learning_rate(1e-3)
            .with_seed(3)
            .with_schedule(NoiseScheduleConfig::new().with_num_train_timesteps(50))
    }

    fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_masked_loss_zero_for_empty_mask() {
        let device = Default::default();
        let prediction = Tensor::<TestBackend, 4>::ones([2, 12, 4, 4], &device);
        let target = Tensor::<TestBackend, 4>::zeros([2, 12, 4, 4], &device);
        let mask = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);

        let loss = values(masked_mse(prediction, target, mask));
        assert_eq!(loss, vec![0.0]);
    }

    #[test]
    fn test_masked_loss_ignores_unmasked_cells() {
        let device = Default::default();
        let prediction = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device);
        // target matches inside the mask (first row), differs by 1 outside
        let target = Tensor::<TestBackend, 1>::from_floats([1.0f32, 1.0, 0.0, 0.0].repeat(3).as_slice(), &device)
            .reshape([1, 3, 2, 2]);
        let mask = Tensor::<TestBackend, 1>::from_floats([1.0f32, 1.0, 0.0, 0.0], &device).reshape([1, 1, 2, 2]);

        assert_eq!(values(masked_mse(prediction.clone(), target.clone(), mask)), vec![0.0]);

        let everything = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        assert_eq!(values(masked_mse(prediction, target, everything)), vec![0.5]);
    }

    #[test]
    fn test_zero_step_training_writes_initial_checkpoint() {
        let (dir, index, ids) = dataset("zero-steps", 3);
        let device = Default::default();
        let config = tiny_config();
        let backbone = config.init_backbone::<TestAutodiffBackend>(&device);
        let before = values(backbone.conv_in.weight.val());

        let data = TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Frozen, 0)
            .init(&config, backbone, data, CheckpointStore::new(dir.join("checkpoints")), &device)
            .unwrap();
        let report = trainer.run().unwrap();

        assert!(report.losses.is_empty());
        assert_eq!(report.checkpoints.len(), 1);
        assert_eq!(values(trainer.model().backbone.conv_in.weight.val()), before);
        assert!(values(trainer.model().adapter.fuse_in.weight.val()).iter().all(|v| *v == 0.0));

        let checkpoint = Checkpoint::load(&report.checkpoints[0]).unwrap();
        assert_eq!(checkpoint.step_count, 0);
        assert_eq!(checkpoint.mode, TrainingMode::Frozen);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_frozen_training_updates_adapter_only() {
        let (dir, index, ids) = dataset("frozen", 3);
        let device = Default::default();
        let config = tiny_config();
        let backbone = config.init_backbone::<TestAutodiffBackend>(&device);
        let before = values(backbone.conv_out.weight.val());

        let data = TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Frozen, 2)
            .init(&config, backbone, data, CheckpointStore::new(dir.join("checkpoints")), &device)
            .unwrap();
        let report = trainer.run().unwrap();

        assert_eq!(report.losses.len(), 2);
        assert!(report.losses.iter().all(|l| l.is_finite()));
        assert_eq!(report.checkpoints.len(), 2);
        assert_eq!(values(trainer.model().backbone.conv_out.weight.val()), before);
        assert!(values(trainer.model().adapter.fuse_in.weight.val()).iter().any(|v| *v != 0.0));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_trainable_training_updates_backbone() {
        let (dir, index, ids) = dataset("trainable", 2);
        let device = Default::default();
        let config = tiny_config();
        let backbone = config.init_backbone::<TestAutodiffBackend>(&device);
        let before = values(backbone.conv_out.weight.val());

        let data = TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Trainable, 1)
            .init(&config, backbone, data, CheckpointStore::new(dir.join("checkpoints")), &device)
            .unwrap();
        trainer.run().unwrap();

        assert_ne!(values(trainer.model().backbone.conv_out.weight.val()), before);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let (dir, index, ids) = dataset("round-trip", 3);
        let device = Default::default();
        let config = tiny_config();
        let store = CheckpointStore::new(dir.join("checkpoints"));
        let backbone = config.init_backbone::<TestAutodiffBackend>(&device);

        let data = TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Frozen, 2)
            .init(&config, backbone, data, store.clone(), &device)
            .unwrap();
        trainer.run().unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest, store.path_for(2));

        let loaded = Checkpoint::load(&latest).unwrap();
        let captured = trainer.checkpoint().unwrap();
        assert_eq!(loaded.trainable_subset, captured.trainable_subset);
        assert_eq!(loaded.trainable_param_count, captured.trainable_param_count);
        assert_eq!(loaded.architecture_tag, config.architecture_tag());
        assert_eq!(loaded.step_count, 2);
        assert!(!loaded.optimizer_state.is_empty());

        // values survive a load into an inference model
        let trained = trainer.valid_model();
        let fresh = InpaintModel::new(trained.backbone.clone(), config.init_adapter::<TestBackend>(&device));
        let restored = loaded.apply(fresh, &config, &device).unwrap();
        assert_eq!(
            values(restored.adapter.fuse_in.weight.val()),
            values(trained.adapter.fuse_in.weight.val())
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resume_continues_step_count() {
        let (dir, index, ids) = dataset("resume", 3);
        let device = Default::default();
        let config = tiny_config();
        let store = CheckpointStore::new(dir.join("checkpoints"));
        let backbone = config.init_backbone::<TestAutodiffBackend>(&device);

        let data = |ids: Vec<RecordId>| TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut first = training_config(TrainingMode::Frozen, 2)
            .init(&config, backbone.clone(), data(ids.clone()), store.clone(), &device)
            .unwrap();
        first.run().unwrap();
        let checkpoint = Checkpoint::load(&store.path_for(2)).unwrap();

        let mut second = training_config(TrainingMode::Frozen, 3)
            .init(&config, backbone.clone(), data(ids.clone()), store.clone(), &device)
            .unwrap()
            .resume(&checkpoint)
            .unwrap();
        assert_eq!(second.step_count(), 2);
        let report = second.run().unwrap();
        assert_eq!(report.losses.len(), 1);
        assert_eq!(report.final_step, 3);

        let mismatched = training_config(TrainingMode::Trainable, 3)
            .init(&config, backbone, data(ids), store, &device)
            .unwrap()
            .resume(&checkpoint);
        assert!(matches!(
            mismatched.err(),
            Some(Error::Inference(InferenceError::CheckpointMismatch(_)))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resumed_finished_run_keeps_checkpoint() {
        let (dir, index, ids) = dataset("resume-finished", 2);
        let device = Default::default();
        let config = tiny_config();
        let store = CheckpointStore::new(dir.join("checkpoints"));
        let backbone = config.init_backbone::<TestAutodiffBackend>(&device);

        let data = |ids: Vec<RecordId>| TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut first = training_config(TrainingMode::Frozen, 2)
            .with_checkpoint_interval(0)
            .init(&config, backbone.clone(), data(ids.clone()), store.clone(), &device)
            .unwrap();
        first.run().unwrap();
        let path = store.path_for(2);
        let written = std::fs::read(&path).unwrap();

        let mut second = training_config(TrainingMode::Frozen, 2)
            .with_checkpoint_interval(0)
            .init(&config, backbone, data(ids), store.clone(), &device)
            .unwrap()
            .resume(&Checkpoint::load(&path).unwrap())
            .unwrap();
        let report = second.run().unwrap();

        assert!(report.losses.is_empty());
        assert!(report.checkpoints.is_empty());
        assert_eq!(report.final_step, 2);
        assert_eq!(std::fs::read(&path).unwrap(), written);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backbone_fingerprint() {
        let device = Default::default();
        let config = tiny_config();
        let backbone = config.init_backbone::<TestBackend>(&device);

        let reloaded = config
            .init_backbone::<TestBackend>(&device)
            .load_record(backbone.clone().into_record());
        assert_eq!(backbone_fingerprint(&reloaded), backbone_fingerprint(&backbone));

        let other = config.init_backbone::<TestBackend>(&device);
        assert_ne!(backbone_fingerprint(&other), backbone_fingerprint(&backbone));
    }

    #[test]
    fn test_frozen_checkpoint_requires_its_backbone() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let checkpoint = Checkpoint::capture(
            &config,
            &model,
            TrainingMode::Frozen,
            5,
            DepthNormalizationConfig::PerScene,
            Vec::new(),
        )
        .unwrap();
        assert_eq!(checkpoint.backbone_fingerprint, backbone_fingerprint(&model.backbone));

        let sampler = Sampler::from_checkpoint(
            &checkpoint,
            &config,
            model.backbone.clone(),
            &SamplerConfig::new(),
            &device,
        );
        assert!(sampler.is_ok());

        let sampler = Sampler::from_checkpoint(
            &checkpoint,
            &config,
            config.init_backbone::<TestBackend>(&device),
            &SamplerConfig::new(),
            &device,
        );
        assert!(matches!(sampler.err(), Some(Error::Inference(InferenceError::CheckpointMismatch(_)))));
    }

    #[test]
    fn test_checkpoint_architecture_checks() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let checkpoint = Checkpoint::capture(
            &config,
            &model,
            TrainingMode::Frozen,
            0,
            DepthNormalizationConfig::PerScene,
            Vec::new(),
        )
        .unwrap();

        let wider = config.clone().with_hidden_channels(16);
        let result = checkpoint.apply(wider.init::<TestBackend>(&device), &wider, &device);
        assert!(matches!(result, Err(Error::Inference(InferenceError::CheckpointMismatch(_)))));

        let mut foreign = checkpoint.clone();
        foreign.architecture_tag = "latent-diffusion/v1".into();
        let result = foreign.apply(config.init::<TestBackend>(&device), &config, &device);
        assert!(matches!(result, Err(Error::Inference(InferenceError::UnknownArchitecture(_)))));

        let mut truncated = checkpoint;
        truncated.trainable_param_count += 1;
        let result = truncated.apply(config.init::<TestBackend>(&device), &config, &device);
        assert!(matches!(result, Err(Error::Inference(InferenceError::CheckpointMismatch(_)))));
    }

    #[test]
    fn test_unloadable_dataset_is_fatal() {
        let (dir, index, ids) = dataset("corrupt", 2);
        for entry in index.entries() {
            std::fs::remove_file(dir.join("dataset").join(&entry.storage_path)).unwrap();
        }
        let device = Default::default();
        let config = tiny_config();

        let data = TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Frozen, 1)
            .init(
                &config,
                config.init_backbone::<TestAutodiffBackend>(&device),
                data,
                CheckpointStore::new(dir.join("checkpoints")),
                &device,
            )
            .unwrap();

        let err = trainer.run().unwrap_err();
        assert!(matches!(err, Error::Training(TrainingError::DatasetCorrupt { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partially_unloadable_dataset_keeps_training() {
        let (dir, index, ids) = dataset("partly-corrupt", 2);
        let broken = index.entries().remove(0);
        std::fs::remove_file(dir.join("dataset").join(&broken.storage_path)).unwrap();
        let device = Default::default();
        let config = tiny_config();

        let data = TrainingData {
            index: &index,
            train_ids: ids,
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Frozen, 10)
            .with_checkpoint_interval(0)
            .init(
                &config,
                config.init_backbone::<TestAutodiffBackend>(&device),
                data,
                CheckpointStore::new(dir.join("checkpoints")),
                &device,
            )
            .unwrap();

        let report = trainer.run().unwrap();
        assert_eq!(report.final_step, 10);
        assert!(report.skipped_records > 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_train_split() {
        let (dir, index, _) = dataset("empty-split", 1);
        let device = Default::default();
        let config = tiny_config();

        let data = TrainingData {
            index: &index,
            train_ids: Vec::new(),
            depth_normalization: DepthNormalizationConfig::PerScene,
        };
        let mut trainer = training_config(TrainingMode::Frozen, 1)
            .init(
                &config,
                config.init_backbone::<TestAutodiffBackend>(&device),
                data,
                CheckpointStore::new(dir.join("checkpoints")),
                &device,
            )
            .unwrap();

        let err = trainer.run().unwrap_err();
        assert!(matches!(err, Error::Training(TrainingError::EmptyTrainSplit)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    fn sampler() -> Sampler<TestBackend> {
        let device = Default::default();
        let config = tiny_config();
        let sampler_config = SamplerConfig::new()
            .with_schedule(NoiseScheduleConfig::new().with_num_train_timesteps(50));
        Sampler::new(
            config.init::<TestBackend>(&device),
            &config,
            DepthNormalizationConfig::PerScene,
            &sampler_config,
            &device,
        )
    }

    #[test]
    fn test_sampler_preserves_unmasked_pixels() {
        let sampler = sampler();
        let image = scene_image(0);
        let mask = mirror_mask();

        let output = sampler.sample(&image, &mask, &scene_depth(), 3, 7).unwrap();
        for (x, y, pixel) in output.enumerate_pixels() {
            if !mask.get(x, y) {
                assert_eq!(pixel, image.get_pixel(x, y));
            }
            assert!(pixel.0.iter().all(|v| (0.0..=1.0).contains(v)));
        }

        let again = sampler.sample(&image, &mask, &scene_depth(), 3, 7).unwrap();
        assert_eq!(output, again);
    }

    #[test]
    fn test_stochastic_sampler_preserves_unmasked_pixels() {
        let device = Default::default();
        let config = tiny_config();
        let sampler = Sampler::<TestBackend>::new(
            config.init(&device),
            &config,
            DepthNormalizationConfig::Fixed { near: 0.0, far: 10.0 },
            &SamplerConfig::new()
                .with_eta(1.0)
                .with_schedule(NoiseScheduleConfig::new().with_num_train_timesteps(50)),
            &device,
        );
        let image = scene_image(3);
        let mask = mirror_mask();

        let output = sampler.sample(&image, &mask, &scene_depth(), 4, 1).unwrap();
        for (x, y, pixel) in output.enumerate_pixels() {
            if !mask.get(x, y) {
                assert_eq!(pixel, image.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn test_zero_step_sampling_decodes_masked_image() {
        let sampler = sampler();
        let image = scene_image(0);
        let mask = mirror_mask();

        let output = sampler.sample(&image, &mask, &scene_depth(), 0, 0).unwrap();
        assert_eq!(output, blank_masked(&image, &mask));
    }

    #[test]
    fn test_empty_mask_is_noop() {
        let sampler = sampler();
        let image = scene_image(5);

        let output = sampler.sample(&image, &Mask::new(16, 16), &scene_depth(), 10, 0).unwrap();
        assert_eq!(output, image);
    }

    #[test]
    fn test_sampler_rejects_shape_mismatch() {
        let sampler = sampler();
        let result = sampler.sample(&scene_image(0), &Mask::new(8, 8), &scene_depth(), 1, 0);
        assert!(matches!(result, Err(Error::Inference(InferenceError::ShapeMismatch(_)))));
    }

    #[test]
    fn test_denoise_steps_are_bounded() {
        let sampler = sampler();
        let steps = sampler
            .denoise_steps(&scene_image(0), &mirror_mask(), &scene_depth(), 5, 2)
            .unwrap();

        assert_eq!(steps.len(), 5);
        let latents: Vec<_> = steps.collect();
        assert_eq!(latents.len(), 5);
        assert!(latents.iter().all(|l| l.dims() == [1, 12, 8, 8]));
    }

    #[test]
    fn test_sampler_from_checkpoint() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let checkpoint = Checkpoint::capture(
            &config,
            &model,
            TrainingMode::Trainable,
            12,
            DepthNormalizationConfig::PerScene,
            Vec::new(),
        )
        .unwrap();

        let backbone = config.init_backbone::<TestBackend>(&device);
        let sampler = Sampler::from_checkpoint(&checkpoint, &config, backbone, &SamplerConfig::new(), &device);
        assert!(sampler.is_ok());

        let other = config.clone().with_adapter_channels(8);
        let backbone = other.init_backbone::<TestBackend>(&device);
        let sampler = Sampler::from_checkpoint(&checkpoint, &other, backbone, &SamplerConfig::new(), &device);
        assert!(matches!(sampler.err(), Some(Error::Inference(InferenceError::CheckpointMismatch(_)))));
    }
}
