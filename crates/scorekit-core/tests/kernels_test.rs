use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use scorekit_core::binary::{predict_binary, predict_binary_using, predict_binary_with};
use scorekit_core::dense::{predict_dense, predict_dense_using};
use scorekit_core::popcount::{count_portable, count_set_bits, count_set_bits_auto};
use scorekit_core::{capabilities, AlignedVec, AlignmentPolicy, Capabilities, KernelError, KernelOptions};

fn random_floats(len: usize, rng: &mut StdRng) -> AlignedVec<f32> {
    let values: Vec<f32> = (0..len).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
    AlignedVec::from(values)
}

fn random_words(len: usize, rng: &mut StdRng) -> AlignedVec<u32> {
    let values: Vec<u32> = (0..len).map(|_| rng.gen()).collect();
    AlignedVec::from(values)
}

#[test]
fn dense_end_to_end_example() {
    let user = AlignedVec::from_slice(&[1.0f32, 0.0, 1.0, 0.0]);
    let items = AlignedVec::from_slice(&[1.0f32, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
    let mut out = [f32::NAN; 2];
    predict_dense(&user, &items, 0.0, &[0.0, 0.0], &mut out).expect("predict dense");
    assert_eq!(out, [2.0, 0.0]);
}

#[test]
fn dense_matches_naive_sum() {
    let mut rng = StdRng::seed_from_u64(7);
    for latent_dim in [1, 7, 8, 9, 16, 33] {
        let num_items = rng.gen_range(1..64);
        let user = random_floats(latent_dim, &mut rng);
        let items = random_floats(num_items * latent_dim, &mut rng);
        let biases = random_floats(num_items, &mut rng);
        let bias_user = rng.gen::<f32>();

        let mut out = vec![0.0f32; num_items];
        predict_dense(&user, &items, bias_user, &biases, &mut out).expect("predict dense");

        for (i, score) in out.iter().enumerate() {
            let row = &items[i * latent_dim..(i + 1) * latent_dim];
            let expected: f64 = row.iter().zip(user.iter()).map(|(a, b)| *a as f64 * *b as f64).sum::<f64>()
                + bias_user as f64
                + biases[i] as f64;
            let err = (*score as f64 - expected).abs();
            assert!(
                err <= 1e-5 * expected.abs().max(1.0),
                "latent_dim {} item {}: {} vs {}",
                latent_dim,
                i,
                score,
                expected
            );
        }
    }
}

#[test]
fn dense_tiers_agree_bitwise() {
    let mut rng = StdRng::seed_from_u64(11);
    let user = random_floats(37, &mut rng);
    let items = random_floats(37 * 20, &mut rng);
    let biases = random_floats(20, &mut rng);
    let options = KernelOptions::default();

    let mut reference = vec![0.0f32; 20];
    predict_dense_using(&user, &items, 0.25, &biases, &mut reference, &options, Capabilities::none()).unwrap();
    for caps in Capabilities::combinations() {
        let mut out = vec![0.0f32; 20];
        predict_dense_using(&user, &items, 0.25, &biases, &mut out, &options, caps).unwrap();
        assert_eq!(
            out.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            reference.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            "caps {:?}",
            caps
        );
    }
}

#[test]
fn binary_scores_within_bounds() {
    let mut rng = StdRng::seed_from_u64(13);
    for latent_dim in [1, 3, 8, 9, 15] {
        let user = random_words(latent_dim, &mut rng);
        let items = random_words(latent_dim * 10, &mut rng);
        let mut out = vec![0.0f32; 10];
        predict_binary(&user, &items, 0.0, &[0.0; 10], 1.0, &[1.0; 10], &mut out).expect("predict binary");

        let max = (latent_dim * 32) as f32;
        for score in &out {
            assert!(*score >= -max && *score <= max);
            // bipolar similarity keeps the parity of the bit count
            assert_eq!((*score as i64).rem_euclid(2), 0);
        }
    }
}

#[test]
fn binary_matches_naive_for_remainder_dims() {
    let mut rng = StdRng::seed_from_u64(17);
    for latent_dim in [1, 3, 9, 15] {
        let num_items = 23;
        let user = random_words(latent_dim, &mut rng);
        let items = random_words(latent_dim * num_items, &mut rng);
        let biases: Vec<f32> = (0..num_items).map(|_| rng.gen::<f32>()).collect();
        let norms: Vec<f32> = (0..num_items).map(|_| rng.gen::<f32>()).collect();

        for caps in Capabilities::combinations() {
            let mut out = vec![0.0f32; num_items];
            predict_binary_using(
                &user,
                &items,
                0.5,
                &biases,
                0.75,
                &norms,
                &mut out,
                &KernelOptions::default(),
                caps,
            )
            .unwrap();

            for (i, score) in out.iter().enumerate() {
                let row = &items[i * latent_dim..(i + 1) * latent_dim];
                let matching: u32 = row.iter().zip(user.iter()).map(|(a, b)| (!(a ^ b)).count_ones()).sum();
                let not_matching = (latent_dim * 32) as u32 - matching;
                let expected = (matching as f32 - not_matching as f32) * 0.75 * norms[i] + 0.5 + biases[i];
                assert!((score - expected).abs() < 1e-4, "latent_dim {} item {}", latent_dim, i);
            }
        }
    }
}

#[test]
fn popcount_tiers_match_portable() {
    let mut rng = StdRng::seed_from_u64(19);
    let bytes: Vec<u8> = (0..5000).map(|_| rng.gen()).collect();
    for len in [0, 1, 7, 8, 31, 32, 511, 512, 513, 4096] {
        let expected = count_portable(&bytes[..len]);
        assert_eq!(count_set_bits_auto(&bytes[..len]), expected);
        for caps in Capabilities::combinations() {
            assert_eq!(count_set_bits(&bytes[..len], caps), expected, "len {} caps {:?}", len, caps);
        }
    }
}

#[test]
fn strict_alignment_gates_only_the_user_vector() {
    let mut rng = StdRng::seed_from_u64(23);
    let backing = random_floats(8 * 4 + 2, &mut rng);
    let items = &backing[2..];
    let user = random_floats(8, &mut rng);
    let mut out = [0.0f32; 4];

    predict_dense(&user, items, 0.0, &[0.0; 4], &mut out).expect("misaligned item base is scored");

    let shifted = random_floats(8 + 2, &mut rng);
    let result = predict_dense(&shifted[2..], items, 0.0, &[0.0; 4], &mut out);
    if capabilities().avx2_fma() {
        assert_eq!(
            result,
            Err(KernelError::Misaligned {
                what: "user vector",
                offset: 8
            })
        );
    } else {
        assert!(result.is_ok());
    }

    let words = random_words(8 * 4 + 1, &mut rng);
    let user_words = random_words(8 + 1, &mut rng);
    let fallback = KernelOptions {
        alignment: AlignmentPolicy::Fallback,
        ..KernelOptions::default()
    };
    predict_binary_with(&user_words[1..], &words[1..], 0.0, &[0.0; 4], 1.0, &[1.0; 4], &mut out, &fallback)
        .expect("fallback never rejects");
}
