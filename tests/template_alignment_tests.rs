// tests/template_alignment_tests.rs

mod common;

use approx::assert_abs_diff_eq;
use common::{assert_signals_close, generate_dummy_signal, modular_parcels};
use float_cmp::approx_eq;
use hyperalign::kernels::frobenius_norm;
use hyperalign::{
    create_template, rescaled_euclidean_mean, AlignmentError, AlignmentMethod, RegionPartition, TemplateAlignment,
    TemplateAlignmentConfig,
};
use ndarray::{array, s, Array2, Axis};

#[test]
fn euclidean_mean_optionally_keeps_the_average_norm() {
    let a = array![[1.0, 0.0], [0.0, 1.0]];
    let b = array![[-1.0, 0.0], [0.0, 3.0]];
    let mean = rescaled_euclidean_mean(&[a.clone(), b.clone()], false).unwrap();
    assert_eq!(mean, array![[0.0, 0.0], [0.0, 2.0]]);

    let rescaled = rescaled_euclidean_mean(&[a.clone(), b.clone()], true).unwrap();
    let average_norm = (frobenius_norm(a.view()) + frobenius_norm(b.view())) / 2.0;
    assert!(approx_eq!(f64, frobenius_norm(rescaled.view()), average_norm, epsilon = 1e-12));

    let zeros = Array2::<f64>::zeros((2, 2));
    let still_zero = rescaled_euclidean_mean(&[zeros.clone(), zeros], true).unwrap();
    assert!(still_zero.iter().all(|v| *v == 0.0));

    assert!(rescaled_euclidean_mean(&[], false).is_err());
    assert!(rescaled_euclidean_mean(&[a, Array2::zeros((3, 2))], false).is_err());
}

#[test]
fn template_iterations_record_their_history() {
    let signals = vec![array![[1.0, 2.0]], array![[3.0, 6.0]]];
    let mut calls = 0;
    let (template, history) = create_template(&signals, 3, false, |_, target| {
        calls += 1;
        Ok(target * 2.0)
    })
    .unwrap();
    // Estimates [2, 4], [4, 8], [8, 16]; only the middle one is intermediate.
    assert_eq!(calls, 4);
    assert_eq!(history, vec![array![[4.0, 8.0]]]);
    assert_eq!(template, array![[8.0, 16.0]]);

    for n_iter in [0, 1] {
        let (plain, empty) = create_template(&signals, n_iter, false, |_, _| unreachable!()).unwrap();
        assert_eq!(plain, array![[2.0, 4.0]]);
        assert!(empty.is_empty());
    }
}

#[test]
fn template_predicts_unseen_conditions_of_a_new_subject() {
    let n_voxels = 40;
    let data = generate_dummy_signal(5, 120, 0, n_voxels, 3, 17);
    let partition = RegionPartition::parcels(modular_parcels(n_voxels, 4), n_voxels).unwrap();

    let mut model = TemplateAlignment::new(TemplateAlignmentConfig {
        alignment_method: AlignmentMethod::default(),
        n_iter: 3,
        n_jobs: -1,
        ..TemplateAlignmentConfig::default()
    });
    let training: Vec<Array2<f64>> = data.train[..4].to_vec();
    model.fit(&training, &partition).unwrap();
    let template = model.template().unwrap();
    assert_eq!(template.dim(), (120, n_voxels));
    assert_eq!(model.template_history().len(), 1);

    // The held-out subject is only observed on the first 90 conditions.
    let new_subject = &data.train[4];
    let train_index: Vec<usize> = (0..90).collect();
    let test_index: Vec<usize> = (90..120).collect();
    let observed = new_subject.select(Axis(0), &train_index);
    let predictions = model.transform(&[observed], &train_index, &test_index).unwrap();
    assert_eq!(predictions.len(), 1);
    assert_signals_close(
        predictions[0].view(),
        new_subject.slice(s![90..120, ..]),
        1.5e-3,
        "held-out conditions",
    );
}

#[test]
fn template_transform_validates_indices_and_shapes() {
    let data = generate_dummy_signal(3, 20, 0, 12, 2, 23);
    let partition = RegionPartition::parcels(modular_parcels(12, 2), 12).unwrap();
    let mut model = TemplateAlignment::new(TemplateAlignmentConfig {
        alignment_method: AlignmentMethod::Identity,
        n_iter: 1,
        ..TemplateAlignmentConfig::default()
    });

    let train_index: Vec<usize> = (0..15).collect();
    let test_index: Vec<usize> = (15..20).collect();
    let observed = data.train[0].slice(s![..15, ..]).to_owned();
    assert!(matches!(
        model.transform(&[observed.clone()], &train_index, &test_index),
        Err(AlignmentError::NotFitted)
    ));
    assert!(matches!(
        model.fit(&data.train[..1], &partition),
        Err(AlignmentError::InvalidInput(_))
    ));

    model.fit(&data.train, &partition).unwrap();
    let mean = rescaled_euclidean_mean(&data.train, false).unwrap();
    for (t, m) in model.template().unwrap().iter().zip(mean.iter()) {
        assert_abs_diff_eq!(*t, *m, epsilon = 1e-12);
    }

    let out_of_range: Vec<usize> = (15..21).collect();
    assert!(matches!(
        model.transform(&[observed.clone()], &train_index, &out_of_range),
        Err(AlignmentError::InvalidInput(_))
    ));
    assert!(matches!(
        model.transform(&[observed.clone()], &train_index[..10], &test_index),
        Err(AlignmentError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        model.transform(&[observed.clone()], &[], &test_index),
        Err(AlignmentError::InvalidInput(_))
    ));

    let predictions = model.transform(&[observed], &train_index, &test_index).unwrap();
    assert_eq!(predictions[0].dim(), (5, 12));
}
