// tests/hyperalignment_tests.rs

mod common;

use common::{assert_signals_close, generate_dummy_searchlights, generate_dummy_signal, modular_parcels};
use hyperalign::hyperalignment::{aggregate_region_predictions, resolve_n_jobs};
use hyperalign::{
    AlignmentError, AlignmentMethod, CacheLocation, Hyperalignment, HyperalignmentConfig, OptimalTransportConfig,
    PartitionMode, RegionId, RegionModel, RegionPartition,
};
use ndarray::{array, s, Array2};
use tempfile::tempdir;

const N_VOXELS: usize = 99;
const N_TRAIN: usize = 149;
const N_TEST: usize = 149;
const N_SUBJECTS: usize = 5;
const N_LATENT: usize = 3;
const TOLERANCE: f64 = 1.5e-3;

fn searchlight_partition() -> RegionPartition {
    let (searchlights, distances) = generate_dummy_searchlights(N_VOXELS, 92, 20.0, 2.0);
    RegionPartition::searchlights(searchlights, Some(distances), Some(20.0), N_VOXELS).unwrap()
}

fn parcel_partition() -> RegionPartition {
    RegionPartition::parcels(modular_parcels(N_VOXELS, 10), N_VOXELS).unwrap()
}

#[test]
fn searchlight_hyperalignment_reproduces_held_out_data() {
    let data = generate_dummy_signal(N_SUBJECTS, N_TRAIN, N_TEST, N_VOXELS, N_LATENT, 42);
    let partition = searchlight_partition();
    assert_eq!(partition.len(), 92);

    let dir = tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let mut model = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Searchlight,
        alignment_method: AlignmentMethod::default(),
        cache: CacheLocation::Directory(cache_dir.clone()),
        ..HyperalignmentConfig::default()
    });
    model.fit(&data.train, &partition).unwrap();
    assert!(cache_dir.is_dir());
    assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 92);

    let predictions = model.transform(&data.test).unwrap();
    assert_eq!(predictions.len(), N_SUBJECTS);
    for (subject, (predicted, observed)) in predictions.iter().zip(&data.test).enumerate() {
        assert_eq!(predicted.dim(), observed.dim());
        assert_signals_close(predicted.view(), observed.view(), TOLERANCE, &format!("subject {}", subject));
    }

    let fit = model.region_fit(RegionId(45)).unwrap();
    assert_eq!(fit.region, RegionId(45));
    match fit.model {
        RegionModel::Shared {
            to_template,
            from_template,
        } => {
            assert_eq!(to_template.len(), N_SUBJECTS);
            assert_eq!(from_template.len(), N_SUBJECTS);
        }
        RegionModel::Pairwise(_) => panic!("multi-subject fit stored a pairwise model"),
    }
}

#[test]
fn parcel_hyperalignment_on_all_workers_reproduces_held_out_data() {
    let data = generate_dummy_signal(N_SUBJECTS, N_TRAIN, N_TEST, N_VOXELS, N_LATENT, 7);
    let partition = parcel_partition();

    let dir = tempdir().unwrap();
    let mut model = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        n_jobs: -1,
        cache: CacheLocation::Directory(dir.path().join("parcels")),
        ..HyperalignmentConfig::default()
    });
    model.fit(&data.train, &partition).unwrap();
    let predictions = model.transform(&data.test).unwrap();
    for (predicted, observed) in predictions.iter().zip(&data.test) {
        assert_eq!(predicted.dim(), observed.dim());
        assert_signals_close(predicted.view(), observed.view(), TOLERANCE, "parcel prediction");
    }
    assert_eq!(model.partition(), Some(&partition));
}

#[test]
fn pairwise_alignment_predicts_the_target_subject() {
    let data = generate_dummy_signal(2, N_TRAIN, N_TEST, N_VOXELS, N_LATENT, 11);

    for partition in [parcel_partition(), searchlight_partition()] {
        let mut model = Hyperalignment::new(HyperalignmentConfig {
            mode: partition.mode(),
            n_jobs: 2,
            cache: CacheLocation::Memory,
            ..HyperalignmentConfig::default()
        });
        model
            .fit_pair(data.train[0].view(), data.train[1].view(), &partition)
            .unwrap();
        let predicted = model.transform_pair(data.test[0].view()).unwrap();
        assert_signals_close(
            predicted.view(),
            data.test[1].view(),
            TOLERANCE,
            &format!("pairwise {}", partition.mode()),
        );
        assert!(matches!(
            model.transform(&data.test),
            Err(AlignmentError::InvalidInput(_))
        ));
    }
}

#[test]
fn deleted_region_records_surface_as_missing_cache_entries() {
    let data = generate_dummy_signal(3, 60, 20, 30, N_LATENT, 3);
    let partition = RegionPartition::parcels(modular_parcels(30, 3), 30).unwrap();
    let dir = tempdir().unwrap();
    let mut model = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        alignment_method: AlignmentMethod::ScaledOrthogonal {
            scaling: true,
            primal: None,
        },
        cache: CacheLocation::Directory(dir.path().to_path_buf()),
        ..HyperalignmentConfig::default()
    });
    model.fit(&data.train, &partition).unwrap();

    let record = model.cache().entry_path(&partition.key(), RegionId(1)).unwrap();
    assert!(record.is_file());
    std::fs::remove_file(&record).unwrap();

    match model.transform(&data.test) {
        Err(AlignmentError::MissingCacheEntry { region, .. }) => assert_eq!(region, 1),
        other => panic!("expected a missing cache entry, got {:?}", other.map(|p| p.len())),
    }
    assert!(matches!(
        model.region_fit(RegionId(1)),
        Err(AlignmentError::MissingCacheEntry { .. })
    ));
    assert!(model.region_fit(RegionId(0)).is_ok());
}

#[test]
fn models_sharing_a_cache_directory_keep_their_own_records() {
    let data = generate_dummy_signal(3, 40, 15, 20, N_LATENT, 13);
    let interleaved = RegionPartition::parcels(modular_parcels(20, 2), 20).unwrap();
    let halves = RegionPartition::parcels(vec![(0..10).collect(), (10..20).collect()], 20).unwrap();
    assert_ne!(interleaved.key(), halves.key());

    let dir = tempdir().unwrap();
    let config = HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        alignment_method: AlignmentMethod::ScaledOrthogonal {
            scaling: true,
            primal: None,
        },
        cache: CacheLocation::Directory(dir.path().to_path_buf()),
        ..HyperalignmentConfig::default()
    };
    let mut first = Hyperalignment::new(config.clone());
    first.fit(&data.train, &interleaved).unwrap();
    let before = first.transform(&data.test).unwrap();

    let mut second = Hyperalignment::new(config);
    second.fit(&data.train, &halves).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 4);

    let after = first.transform(&data.test).unwrap();
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a, b);
    }
}

#[test]
fn failing_regions_are_reported_without_discarding_the_others() {
    let data = generate_dummy_signal(2, 40, 10, 30, N_LATENT, 5);
    let partition = RegionPartition::parcels(modular_parcels(30, 3), 30).unwrap();
    let mut source = data.train[0].clone();
    let mut target = data.train[1].clone();
    // Parcel 0 carries no signal, so its transport problem is solved in one sweep.
    for &voxel in partition.regions()[0].voxels() {
        source.column_mut(voxel).fill(0.0);
        target.column_mut(voxel).fill(0.0);
    }

    let mut model = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        alignment_method: AlignmentMethod::OptimalTransport(OptimalTransportConfig {
            tol: 1e-12,
            max_iter: 1,
            ..OptimalTransportConfig::default()
        }),
        cache: CacheLocation::Memory,
        ..HyperalignmentConfig::default()
    });
    match model.fit_pair(source.view(), target.view(), &partition) {
        Err(AlignmentError::RegionFailures { total, failures }) => {
            assert_eq!(total, 3);
            let failed: Vec<usize> = failures.iter().map(|f| f.region).collect();
            assert_eq!(failed, vec![1, 2]);
            assert!(failures.iter().all(|f| f.message.contains("did not converge")));
        }
        other => panic!("expected region failures, got {:?}", other),
    }
    assert!(model.region_fit(RegionId(0)).is_ok());
    assert!(matches!(
        model.region_fit(RegionId(2)),
        Err(AlignmentError::MissingCacheEntry { .. })
    ));
}

#[test]
fn eviction_errors_are_folded_into_the_region_failures() {
    let data = generate_dummy_signal(2, 40, 10, 30, N_LATENT, 5);
    let partition = RegionPartition::parcels(modular_parcels(30, 3), 30).unwrap();
    let mut source = data.train[0].clone();
    let mut target = data.train[1].clone();
    for &voxel in partition.regions()[0].voxels() {
        source.column_mut(voxel).fill(0.0);
        target.column_mut(voxel).fill(0.0);
    }

    let dir = tempdir().unwrap();
    let mut model = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        alignment_method: AlignmentMethod::OptimalTransport(OptimalTransportConfig {
            tol: 1e-12,
            max_iter: 1,
            ..OptimalTransportConfig::default()
        }),
        cache: CacheLocation::Directory(dir.path().to_path_buf()),
        ..HyperalignmentConfig::default()
    });
    // A directory squatting on region 2's record cannot be removed as a file.
    let blocked = model.cache().entry_path(&partition.key(), RegionId(2)).unwrap();
    std::fs::create_dir_all(&blocked).unwrap();

    match model.fit_pair(source.view(), target.view(), &partition) {
        Err(AlignmentError::RegionFailures { total, failures }) => {
            assert_eq!(total, 3);
            let failed: Vec<usize> = failures.iter().map(|f| f.region).collect();
            assert_eq!(failed, vec![1, 2]);
            assert!(!failures[0].message.contains("stale record"));
            assert!(failures[1].message.contains("did not converge"));
            assert!(failures[1].message.contains("stale record"));
        }
        other => panic!("expected region failures, got {:?}", other),
    }
    assert!(model.region_fit(RegionId(0)).is_ok());
}

#[test]
fn inputs_are_validated_against_the_fit() {
    let data = generate_dummy_signal(3, 30, 10, 20, 2, 9);
    let partition = RegionPartition::parcels(modular_parcels(20, 2), 20).unwrap();

    let mut wrong_mode = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Searchlight,
        cache: CacheLocation::Memory,
        ..HyperalignmentConfig::default()
    });
    assert!(matches!(
        wrong_mode.fit(&data.train, &partition),
        Err(AlignmentError::InvalidInput(_))
    ));

    let mut model = Hyperalignment::new(HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        alignment_method: AlignmentMethod::Identity,
        cache: CacheLocation::Memory,
        ..HyperalignmentConfig::default()
    });
    assert!(matches!(model.transform(&data.test), Err(AlignmentError::NotFitted)));
    model.fit(&data.train, &partition).unwrap();

    assert!(matches!(
        model.transform(&data.test[..2]),
        Err(AlignmentError::ShapeMismatch { .. })
    ));
    let narrow: Vec<Array2<f64>> = data.test.iter().map(|x| x.slice(s![.., ..19]).to_owned()).collect();
    assert!(matches!(
        model.transform(&narrow),
        Err(AlignmentError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        model.transform_pair(data.test[0].view()),
        Err(AlignmentError::InvalidInput(_))
    ));
}

#[test]
fn overlapping_predictions_are_weighted_then_rescaled() {
    let partition = RegionPartition::searchlights(
        vec![vec![0, 1], vec![1, 2]],
        Some(vec![vec![0.0, 1.0], vec![3.0, 0.0]]),
        Some(4.0),
        3,
    )
    .unwrap();
    let first = array![[1.0, 2.0], [1.0, 2.0]];
    let second = array![[6.0, 3.0], [6.0, 3.0]];

    let merged = aggregate_region_predictions(&partition, &[&first, &second], 2, None).unwrap();
    // Voxel 1: weights 0.75 and 0.25.
    assert_eq!(merged.column(0).to_vec(), vec![1.0, 1.0]);
    assert_eq!(merged.column(1).to_vec(), vec![3.0, 3.0]);
    assert_eq!(merged.column(2).to_vec(), vec![3.0, 3.0]);

    let reference = array![[0.0, 6.0, 0.0], [0.0, 6.0, 0.0]];
    let rescaled = aggregate_region_predictions(&partition, &[&first, &second], 2, Some(reference.view())).unwrap();
    assert_eq!(rescaled.column(0).to_vec(), vec![1.0, 1.0]);
    assert_eq!(rescaled.column(1).to_vec(), vec![6.0, 6.0]);
    assert_eq!(rescaled.column(2).to_vec(), vec![3.0, 3.0]);
}

#[test]
fn n_jobs_follows_the_worker_convention() {
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    assert_eq!(resolve_n_jobs(1).unwrap(), 1);
    assert_eq!(resolve_n_jobs(3).unwrap(), 3);
    assert_eq!(resolve_n_jobs(-1).unwrap(), available);
    assert_eq!(resolve_n_jobs(-2).unwrap(), available.saturating_sub(1).max(1));
    assert!(resolve_n_jobs(0).is_err());
}

#[test]
fn configs_round_trip_through_json() {
    let config = HyperalignmentConfig {
        mode: PartitionMode::Parcel,
        n_jobs: -1,
        cache: CacheLocation::Memory,
        ..HyperalignmentConfig::default()
    };
    let text = serde_json::to_string(&config).unwrap();
    let parsed: HyperalignmentConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, config);

    let partial: HyperalignmentConfig =
        serde_json::from_str(r#"{"mode": "parcel", "alignment_method": {"method": "diagonal"}}"#).unwrap();
    assert_eq!(partial.mode, PartitionMode::Parcel);
    assert_eq!(partial.alignment_method, AlignmentMethod::Diagonal);
    assert_eq!(partial.cache, CacheLocation::Directory("cache".into()));
}
