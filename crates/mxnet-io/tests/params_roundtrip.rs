use std::path::Path;

use half::f16;
use mxnet_conformance::assert_allclose;
use mxnet_conformance::fixtures::{MLP_INPUT, MlpWeights, mlp_symbol_json};
use mxnet_core::{DType, NdManager, ParameterSet, Shape};
use mxnet_io::{load_safetensors, load_safetensors_mmap, load_symbol_block, save_safetensors};
use safetensors::tensor::TensorView;

fn mlp_params(manager: &NdManager) -> ParameterSet {
    let mut params = ParameterSet::new();
    for (name, dims, values) in MlpWeights::deterministic().named() {
        params
            .insert(name, manager.from_f32(values, &Shape::new(dims)).unwrap())
            .unwrap();
    }
    params
}

#[test]
fn roundtrip_f32() {
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.safetensors");

    let data = vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let mut params = ParameterSet::new();
    params
        .insert("weight", manager.from_f32(&data, &Shape::new(vec![2, 3])).unwrap())
        .unwrap();

    save_safetensors(&path, &params).unwrap();
    let loaded = load_safetensors(&path, &manager).unwrap();

    assert_eq!(loaded.len(), 1);
    let w = loaded.get("weight").unwrap();
    assert_eq!(w.shape().unwrap(), Shape::new(vec![2, 3]));
    assert_eq!(w.dtype().unwrap(), DType::F32);
    assert_eq!(w.to_vec_f32().unwrap(), data);
}

#[test]
fn roundtrip_mmap_sorts_names() {
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mlp.safetensors");

    save_safetensors(&path, &mlp_params(&manager)).unwrap();
    let loaded = load_safetensors_mmap(&path, &manager).unwrap();

    assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["b1", "b2", "w1", "w2"]);
    let weights = MlpWeights::deterministic();
    for (name, dims, values) in weights.named() {
        let array = loaded.get(name).unwrap();
        assert_eq!(array.shape().unwrap(), Shape::new(dims));
        assert_eq!(array.to_vec_f32().unwrap(), values);
    }
}

#[test]
fn empty_parameter_set() {
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.safetensors");

    save_safetensors(&path, &ParameterSet::new()).unwrap();
    assert!(load_safetensors(&path, &manager).unwrap().is_empty());
}

#[test]
fn mxnet_prefixes_and_half_precision() {
    let _ = tracing_subscriber::fmt::try_init();
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exported.safetensors");

    let weight: Vec<u8> = [0.5f32, -1.25, 2.0, 4.0]
        .iter()
        .flat_map(|v| f16::from_f32(*v).to_le_bytes())
        .collect();
    let mean: Vec<u8> = [3.0f32].iter().flat_map(|v| v.to_le_bytes()).collect();
    let views = vec![
        (
            "arg:fc_weight",
            TensorView::new(safetensors::Dtype::F16, vec![2, 2], &weight).unwrap(),
        ),
        (
            "aux:bn_moving_mean",
            TensorView::new(safetensors::Dtype::F32, vec![1], &mean).unwrap(),
        ),
    ];
    safetensors::serialize_to_file(views, &None, &path).unwrap();

    let loaded = load_safetensors(&path, &manager).unwrap();
    assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["fc_weight", "bn_moving_mean"]);
    let w = loaded.get("fc_weight").unwrap();
    assert_eq!(w.dtype().unwrap(), DType::F32);
    assert_eq!(w.to_vec_f32().unwrap(), vec![0.5, -1.25, 2.0, 4.0]);
    assert_eq!(loaded.get("bn_moving_mean").unwrap().to_vec_f32().unwrap(), vec![3.0]);
}

#[test]
fn error_missing_file() {
    let manager = NdManager::cpu();
    let result = load_safetensors(Path::new("/nonexistent/path.safetensors"), &manager);
    assert!(result.is_err());
}

#[test]
fn error_corrupt_file() {
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.safetensors");
    std::fs::write(&path, b"not a valid safetensors file").unwrap();

    assert!(load_safetensors(&path, &manager).is_err());
}

#[test]
fn symbol_block_from_directory_runs() {
    let _ = tracing_subscriber::fmt::try_init();
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("mlp-symbol.json"), mlp_symbol_json()).unwrap();
    save_safetensors(&dir.path().join("mlp.safetensors"), &mlp_params(&manager)).unwrap();

    let block = load_symbol_block(dir.path(), "mlp", &manager).unwrap();
    assert_eq!(block.runtime_input_names().unwrap(), vec!["data"]);

    let mut op = block.cached_op(&manager).unwrap();
    let x = [0.3f32, -0.7, 1.1];
    let input = manager
        .from_f32(&x, &Shape::new(vec![1, MLP_INPUT as i64]))
        .unwrap();
    let out = op.invoke(&[&input]).unwrap();
    let expected = MlpWeights::deterministic().forward(&x);
    assert_allclose(&out[0].to_vec_f32().unwrap(), &expected, 1e-5, 1e-5);
}

#[test]
fn symbol_block_missing_params_is_io_error() {
    let manager = NdManager::cpu();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("mlp-symbol.json"), mlp_symbol_json()).unwrap();

    let err = load_symbol_block(dir.path(), "mlp", &manager).unwrap_err();
    assert!(matches!(err, mxnet_core::MxError::Io(_)), "got {err:?}");
}
