use std::path::PathBuf;

use burn::{
    backend::NdArray,
    prelude::*,
    tensor::{Distribution, Tolerance},
};

use crate::{
    create_backbone, save_weights, Activation, BackboneConfig, BackboneKind, DeepLabError,
    DeepLabV3Config, InputShape, Interpolation, SegmentationHeadConfig,
    SpatialPyramidPoolingConfig, WeightsReference,
};

type TestBackend = NdArray<f32>;

/// ResNet18 at `level` with a narrow pooling module and head.
fn small_config(level: usize, input_shape: InputShape) -> DeepLabV3Config {
    DeepLabV3Config::new(
        4,
        BackboneConfig::new(BackboneKind::ResNet18)
            .with_level(level)
            .with_input_shape(input_shape),
    )
    .with_spatial_pyramid_pooling(Some(
        SpatialPyramidPoolingConfig::new(vec![2, 4]).with_num_channels(16),
    ))
    .with_segmentation_head(Some(
        SegmentationHeadConfig::new(4)
            .with_convolutions(1)
            .with_filters(8)
            .with_kernel_size(1),
    ))
}

fn images(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
}

#[test]
fn test_default_configuration() {
    let config = DeepLabV3Config::new(21, BackboneConfig::new(BackboneKind::ResNet50));

    assert_eq!(config.weight_decay, 0.0001);
    assert_eq!(config.segmentation_head_activation, Activation::Softmax);
    assert_eq!(config.interpolation, Interpolation::Bilinear);
    assert_eq!(config.input_shape, InputShape::new());
    assert_eq!(config.input_shape.channels, 3);
    assert!(config.spatial_pyramid_pooling.is_none());
    assert!(config.segmentation_head.is_none());
    assert!(config.weights.is_none());
    assert_eq!(config.backbone.level, 5);

    let head = config.default_head();
    assert_eq!(head.num_classes, 21);
    assert_eq!(head.convolutions, 1);
    assert_eq!(head.kernel_size, 1);
    assert!((head.dropout - 0.2).abs() < f64::EPSILON);
    assert_eq!(head.activation, Activation::Softmax);
}

#[test]
fn test_default_modules_are_filled_in() {
    let device = Default::default();
    let config = DeepLabV3Config::new(
        2,
        BackboneConfig::new(BackboneKind::ResNet18).with_input_shape(InputShape::fixed(64, 64, 3)),
    )
    .with_segmentation_head_activation(Activation::Sigmoid);

    let model = config.init::<TestBackend>(&device).unwrap();
    let resolved = model.config();

    let pooling = resolved.spatial_pyramid_pooling.unwrap();
    assert_eq!(pooling.dilation_rates, vec![6, 12, 18]);
    assert_eq!(pooling.num_channels, 256);

    let head = resolved.segmentation_head.unwrap();
    assert_eq!(head.convolutions, 1);
    assert_eq!(head.activation, Activation::Sigmoid);
    assert_eq!(model.segmentation_head().num_blocks(), 1);
    assert_eq!(model.spatial_pyramid_pooling().num_branches(), 5);
}

#[test]
fn test_output_resolution_matches_divisible_input() {
    let device = Default::default();
    let model = small_config(5, InputShape::fixed(64, 64, 3))
        .init::<TestBackend>(&device)
        .unwrap();

    let output = model.forward(images([2, 3, 64, 64]));

    assert_eq!(model.upsample_factor(), [32, 32]);
    assert_eq!(output.dims(), [2, 4, 64, 64]);
    assert_eq!(model.compute_output_shape([2, 3, 64, 64]), [2, 4, 64, 64]);
}

#[test]
fn test_upsample_factor_floors_on_indivisible_input() {
    let device = Default::default();
    let model = small_config(5, InputShape::fixed(70, 50, 3))
        .init::<TestBackend>(&device)
        .unwrap();

    // 70 -> 3 features (factor 23), 50 -> 2 features (factor 25)
    assert_eq!(model.upsample_factor(), [23, 25]);

    let output = model.forward(images([1, 3, 70, 50]));
    assert_eq!(output.dims(), [1, 4, 69, 50]);
    assert_eq!(model.compute_output_shape([1, 3, 70, 50]), output.dims());
}

#[test]
fn test_softmax_probabilities_sum_to_one() {
    let device = Default::default();
    let model = small_config(4, InputShape::fixed(32, 32, 3))
        .init::<TestBackend>(&device)
        .unwrap();

    let sums = model.forward(images([1, 3, 32, 32])).sum_dim(1);

    sums.into_data().assert_approx_eq::<f32>(
        &Tensor::<TestBackend, 4>::ones([1, 1, 32, 32], &device).into_data(),
        Tolerance::absolute(1e-5),
    );
}

#[test]
fn test_densenet_backbone() {
    let device = Default::default();
    let config = DeepLabV3Config::new(
        3,
        BackboneConfig::new(BackboneKind::DenseNet121).with_input_shape(InputShape::fixed(64, 64, 3)),
    )
    .with_spatial_pyramid_pooling(Some(SpatialPyramidPoolingConfig::new(vec![]).with_num_channels(8)));

    let model = config.init::<TestBackend>(&device).unwrap();

    assert_eq!(model.forward(images([1, 3, 64, 64])).dims(), [1, 3, 64, 64]);
}

#[test]
fn test_unresolved_input_shape() {
    let device = Default::default();
    let config = small_config(5, InputShape::new());

    match config.init::<TestBackend>(&device) {
        Err(DeepLabError::UnresolvedInputShape { .. }) => {}
        other => panic!("Expected UnresolvedInputShape error, got {:?}", other.err()),
    }
}

#[test]
fn test_partial_input_shape_is_completed_from_backbone() {
    let device = Default::default();
    let config = small_config(5, InputShape::fixed(32, 96, 3)).with_input_shape(InputShape {
        height: Some(64),
        width: None,
        channels: 3,
    });

    let model = config.init::<TestBackend>(&device).unwrap();

    assert_eq!(model.config().input_shape, InputShape::fixed(64, 96, 3));
    assert_eq!(model.upsample_factor(), [32, 32]);
}

#[test]
fn test_input_tensor_overrides_declared_shape() {
    let device = Default::default();
    let config = small_config(4, InputShape::new());
    let backbone = create_backbone::<TestBackend>(&config.backbone, &device).unwrap();
    let input = images([1, 3, 48, 32]);

    let model = config.init_with_input(backbone, &input, &device).unwrap();

    assert_eq!(model.upsample_factor(), [16, 16]);
    assert_eq!(model.forward(input).dims(), [1, 4, 48, 32]);
}

#[test]
fn test_external_backbone() {
    let device = Default::default();
    let config = small_config(3, InputShape::fixed(32, 32, 3));
    let backbone = create_backbone::<TestBackend>(&config.backbone, &device).unwrap();

    let model = config.init_with_backbone(backbone, &device).unwrap();

    assert_eq!(model.upsample_factor(), [8, 8]);
    assert_eq!(model.backbone().level(), 3);
}

#[test]
fn test_invalid_num_classes() {
    let device = Default::default();
    let config = DeepLabV3Config {
        num_classes: 0,
        ..small_config(5, InputShape::fixed(64, 64, 3))
    }
    .with_segmentation_head(None);

    match config.init::<TestBackend>(&device) {
        Err(DeepLabError::InvalidConfiguration { reason }) => {
            assert!(reason.contains("num_classes"));
        }
        other => panic!("Expected InvalidConfiguration error, got {:?}", other.err()),
    }
}

#[test]
fn test_invalid_weight_decay() {
    let device = Default::default();
    for weight_decay in [-1.0, f64::NAN] {
        let config = small_config(5, InputShape::fixed(64, 64, 3)).with_weight_decay(weight_decay);
        assert!(matches!(
            config.init::<TestBackend>(&device),
            Err(DeepLabError::InvalidConfiguration { .. })
        ));
    }
}

#[test]
fn test_head_class_count_mismatch() {
    let device = Default::default();
    let config = DeepLabV3Config {
        num_classes: 5,
        ..small_config(5, InputShape::fixed(64, 64, 3))
    };

    assert!(matches!(
        config.init::<TestBackend>(&device),
        Err(DeepLabError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_even_head_kernel_rejected() {
    let device = Default::default();
    let config = small_config(5, InputShape::fixed(64, 64, 3)).with_segmentation_head(Some(
        SegmentationHeadConfig::new(4).with_filters(8).with_kernel_size(2),
    ));

    match config.init::<TestBackend>(&device) {
        Err(DeepLabError::InvalidConfiguration { reason }) => {
            assert!(reason.contains("kernel_size"));
        }
        other => panic!("Expected InvalidConfiguration error, got {:?}", other.err()),
    }
}

#[test]
fn test_input_channels_must_match_backbone() {
    let device = Default::default();
    let config = small_config(5, InputShape::fixed(64, 64, 3))
        .with_input_shape(InputShape::fixed(64, 64, 1));

    match config.init::<TestBackend>(&device) {
        Err(DeepLabError::InvalidConfiguration { reason }) => {
            assert!(reason.contains("channels"));
        }
        other => panic!("Expected InvalidConfiguration error, got {:?}", other.err()),
    }
}

#[test]
fn test_input_tensor_channels_must_match_backbone() {
    let device = Default::default();
    let config = small_config(4, InputShape::new());
    let backbone = create_backbone::<TestBackend>(&config.backbone, &device).unwrap();

    let result = config.init_with_input(backbone, &images([1, 1, 32, 32]), &device);

    assert!(matches!(
        result,
        Err(DeepLabError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_missing_weights_fail_before_construction() {
    let device = Default::default();
    let config = small_config(5, InputShape::new()).with_weights(Some(WeightsReference::Path(
        PathBuf::from("/nonexistent/deeplab.mpk"),
    )));

    // The input shape is unresolvable too; the weights check runs first.
    match config.init::<TestBackend>(&device) {
        Err(DeepLabError::WeightsNotFound { path }) => {
            assert!(path.contains("deeplab.mpk"));
        }
        other => panic!("Expected WeightsNotFound error, got {:?}", other.err()),
    }
}

#[test]
fn test_weights_are_loaded_after_construction() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(4, InputShape::fixed(32, 32, 3));

    let trained = config.init::<TestBackend>(&device).unwrap();
    save_weights(trained.clone(), &dir.path().join("model")).unwrap();

    let loaded = config
        .clone()
        .with_weights(Some(WeightsReference::Path(dir.path().join("model.mpk"))))
        .init::<TestBackend>(&device)
        .unwrap();

    let input = images([1, 3, 32, 32]);
    loaded.forward(input.clone()).into_data().assert_approx_eq::<f32>(
        &trained.forward(input).into_data(),
        Tolerance::absolute(1e-5),
    );
}

#[test]
fn test_unknown_backbone_in_serialized_config() {
    let config = small_config(5, InputShape::fixed(64, 64, 3));
    let json = serde_json::to_string(&config)
        .unwrap()
        .replace("\"ResNet18\"", "\"ResNet19\"");

    match DeepLabV3Config::from_json(&json) {
        Err(DeepLabError::InvalidBackbone { backbone }) => {
            assert!(backbone.contains("ResNet19"));
        }
        other => panic!("Expected InvalidBackbone error, got {other:?}"),
    }
}

#[test]
fn test_backbone_names_are_case_insensitive() {
    let config = small_config(5, InputShape::fixed(64, 64, 3));
    let json = serde_json::to_string(&config)
        .unwrap()
        .replace("\"ResNet18\"", "\"resnet18\"");

    let parsed = DeepLabV3Config::from_json(&json).unwrap();

    assert_eq!(parsed.backbone.kind, BackboneKind::ResNet18);
}

#[test]
fn test_config_file_round_trip() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deeplab.json");

    let model = small_config(4, InputShape::fixed(32, 32, 3))
        .with_interpolation(Interpolation::Nearest)
        .init::<TestBackend>(&device)
        .unwrap();
    model.config().save_json(&path).unwrap();

    let restored = DeepLabV3Config::load_json(&path).unwrap();
    assert_eq!(restored.num_classes, 4);
    assert_eq!(restored.interpolation, Interpolation::Nearest);
    assert_eq!(restored.backbone.level, 4);
    assert_eq!(
        restored.spatial_pyramid_pooling.as_ref().unwrap().dilation_rates,
        vec![2, 4]
    );

    let rebuilt = restored.init::<TestBackend>(&device).unwrap();
    assert_eq!(rebuilt.upsample_factor(), model.upsample_factor());
    assert_eq!(
        rebuilt.compute_output_shape([1, 3, 32, 32]),
        model.compute_output_shape([1, 3, 32, 32])
    );
}

#[test]
fn test_load_json_missing_file() {
    assert!(matches!(
        DeepLabV3Config::load_json("/nonexistent/deeplab.json"),
        Err(DeepLabError::InvalidConfiguration { .. })
    ));
}
