use arghmm_rs::ArgModel;
use arghmm_rs::forward::{forward_algorithm, forward_switch};
use arghmm_rs::matrices::MatrixList;
use arghmm_rs::seq::Sequences;
use arghmm_rs::states::{State, ThreadMode, state_priors};
use arghmm_rs::thread::{cond_sample_thread, max_thread, sample_thread};
use arghmm_rs::traceback::{max_traceback, stochastic_traceback};
use arghmm_rs::trans::{TransMatrixSwitch, Transition};
use arghmm_rs::tree::{LocalTree, LocalTrees, TreeBlock};
use arghmm_rs::utils::argmax;
use rand::SeedableRng;
use rand::rngs::SmallRng;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn test_model() -> ArgModel {
    ArgModel::new(
        vec![0.0, 10.0, 100.0, 1000.0, 10000.0],
        vec![1e4],
        1e-4,
        1e-4,
    )
    .expect("failed to create model")
}

/// ((0, 1), 2)
fn tree_a() -> LocalTree {
    LocalTree::from_parents(
        &[Some(3), Some(3), Some(4), Some(4), None],
        &[0, 0, 0, 1, 2],
    )
    .expect("tree")
}

/// (0, (1, 2))
fn tree_c() -> LocalTree {
    LocalTree::from_parents(
        &[Some(4), Some(3), Some(3), Some(4), None],
        &[0, 0, 0, 1, 2],
    )
    .expect("tree")
}

fn ln(p: f64) -> f64 {
    p.ln()
}

fn switch_a_to_c() -> TransMatrixSwitch {
    let n = 11;
    let mut recoal_row = vec![f64::NEG_INFINITY; n];
    recoal_row[3] = ln(0.5);
    recoal_row[4] = ln(0.5);
    TransMatrixSwitch::new(
        n,
        n,
        Some(0),
        Some(3),
        (0..n).map(Some).collect(),
        vec![0.0; n],
        vec![ln(1.0 / n as f64); n],
        recoal_row,
    )
    .expect("switch")
}

fn three_block_trees() -> LocalTrees {
    LocalTrees::new(
        1000,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 6,
                switch: None,
            },
            TreeBlock {
                tree: tree_a(),
                len: 4,
                switch: None,
            },
            TreeBlock {
                tree: tree_c(),
                len: 5,
                switch: Some(switch_a_to_c()),
            },
        ],
    )
    .expect("trees")
}

fn test_seqs() -> Sequences {
    Sequences::from_strs(&[
        "AACGTACGTAACGTA",
        "AACGTACGTTACGTA",
        "AACCTACGTAACGAA",
        "AACGTNCGTAACGTT",
    ])
    .expect("seqs")
}

fn step_log(list: &MatrixList<'_>, pos: usize, j: usize, k: usize) -> f64 {
    let block = list
        .blocks
        .iter()
        .find(|b| b.start <= pos && pos < b.end())
        .expect("position inside a block");
    match (pos == block.start, block.switch) {
        (true, Some(sw)) => sw.get_log(j, k),
        _ => block.trans.get_log(j, k),
    }
}

#[test]
fn forward_columns_sum_to_one() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    assert_eq!(list.num_blocks(), 3);
    let fwd = forward_algorithm(&list, &model, None, false).expect("forward");
    assert_eq!(fwd.len(), 15);
    assert_eq!(fwd.start_coord, 1000);
    for (i, col) in fwd.cols.iter().enumerate() {
        assert_eq!(col.len(), 11);
        let sum: f64 = col.iter().sum();
        approx_eq(sum, 1.0, 1e-12);
        assert!(col.iter().all(|v| v.is_finite() && *v >= 0.0), "bad column {i}");
    }
}

#[test]
fn compressed_forward_matches_dense_recursion() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let fwd = forward_algorithm(&list, &model, None, false).expect("forward");

    let first = &list.blocks[0];
    let prior = state_priors(&first.states, &first.lineages, &model, first.minage);
    let mut col0: Vec<f64> = prior
        .iter()
        .enumerate()
        .map(|(k, p)| p * first.emit[[0, k]])
        .collect();
    let norm: f64 = col0.iter().sum();
    col0.iter_mut().for_each(|v| *v /= norm);
    for (a, b) in col0.iter().zip(fwd.col(0)) {
        approx_eq(*a, *b, 1e-12);
    }

    for block in &list.blocks {
        for pos in block.start.max(1)..block.end() {
            let prev = fwd.col(pos - 1);
            let mut dense = vec![0.0; block.width()];
            for (k, v) in dense.iter_mut().enumerate() {
                let mut sum = 0.0;
                for (j, f) in prev.iter().enumerate() {
                    sum += f * step_log(&list, pos, j, k).exp();
                }
                *v = sum * block.emit[[pos - block.start, k]];
            }
            let norm: f64 = dense.iter().sum();
            for (k, v) in dense.iter().enumerate() {
                approx_eq(v / norm, fwd.col(pos)[k], 1e-10);
            }
        }
    }
}

#[test]
fn stochastic_traceback_is_reproducible_and_feasible() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let fwd = forward_algorithm(&list, &model, None, false).expect("forward");

    let mut rng1 = SmallRng::seed_from_u64(42);
    let mut rng2 = SmallRng::seed_from_u64(42);
    let path1 = stochastic_traceback(&list, &fwd, &mut rng1, None).expect("traceback");
    let path2 = stochastic_traceback(&list, &fwd, &mut rng2, None).expect("traceback");
    assert_eq!(path1, path2);
    assert_eq!(path1.len(), 15);

    for pos in 1..path1.len() {
        let w = step_log(&list, pos, path1[pos - 1], path1[pos]).exp();
        assert!(w > 0.0, "zero-weight transition at {pos}");
        assert!(fwd.col(pos)[path1[pos]] > 0.0);
    }
}

#[test]
fn max_traceback_picks_best_predecessor() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let fwd = forward_algorithm(&list, &model, None, false).expect("forward");
    let path = max_traceback(&list, &fwd, None).expect("traceback");

    let last = fwd.len() - 1;
    assert_eq!(Some(path[last]), argmax(fwd.col(last)));
    for pos in 1..path.len() {
        let k = path[pos];
        let scores: Vec<f64> = fwd
            .col(pos - 1)
            .iter()
            .enumerate()
            .map(|(j, f)| f.ln() + step_log(&list, pos, j, k))
            .collect();
        assert_eq!(Some(path[pos - 1]), argmax(&scores), "not maximal at {pos}");
    }

    let again = max_thread(&trees, &model, &seqs, ThreadMode::Leaf, false).expect("max thread");
    assert_eq!(again.path, path);
    assert_eq!(again.states.len(), 15);
}

#[test]
fn sample_thread_reports_states_per_site() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let mut rng = SmallRng::seed_from_u64(7);
    let thread =
        sample_thread(&trees, &model, &seqs, ThreadMode::Leaf, &mut rng, false).expect("thread");
    assert_eq!(thread.start_coord, 1000);
    assert_eq!(thread.path.len(), 15);
    for (pos, state) in thread.states.iter().enumerate() {
        let state = state.expect("leaf threading always has states");
        let tree = if pos < 10 { tree_a() } else { tree_c() };
        assert!(state.time >= tree.age(state.node));
        if let Some(p) = tree.node(state.node).parent {
            assert!(state.time <= tree.age(p));
        }
    }
}

#[test]
fn conditional_sampling_honours_fixed_ends() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let start = State::new(2, 1);
    let end = State::new(4, 3);
    let mut rng = SmallRng::seed_from_u64(3);
    let thread = cond_sample_thread(
        &trees,
        &model,
        &seqs,
        ThreadMode::Leaf,
        &mut rng,
        Some(start),
        Some(end),
        false,
    )
    .expect("conditional thread");
    assert_eq!(thread.states[0], Some(start));
    assert_eq!(thread.states[14], Some(end));

    let mut rng = SmallRng::seed_from_u64(3);
    let bad = cond_sample_thread(
        &trees,
        &model,
        &seqs,
        ThreadMode::Leaf,
        &mut rng,
        Some(State::new(0, 3)),
        None,
        false,
    );
    assert!(bad.is_err());
}

#[test]
fn fully_specified_trees_give_trivial_columns() {
    let model = test_model();
    let trees = LocalTrees::new(
        0,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 3,
                switch: None,
            },
            TreeBlock {
                tree: tree_c(),
                len: 2,
                switch: Some(TransMatrixSwitch::identity(0)),
            },
        ],
    )
    .expect("trees");
    let seqs = Sequences::from_strs(&["ACGTA", "ACGTT", "TCGAA"]).expect("seqs");
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Internal).expect("matrices");
    let fwd = forward_algorithm(&list, &model, None, false).expect("forward");
    assert!(fwd.cols.iter().all(|c| c == &vec![1.0]));

    let mut rng = SmallRng::seed_from_u64(1);
    let thread = sample_thread(&trees, &model, &seqs, ThreadMode::Internal, &mut rng, false)
        .expect("thread");
    assert_eq!(thread.path, vec![0; 5]);
    assert!(thread.states.iter().all(Option::is_none));
}

#[test]
fn unreachable_end_state_is_fatal() {
    let model = test_model();
    let n = 11;
    let collapse = TransMatrixSwitch::new(
        n,
        n,
        None,
        None,
        vec![Some(0); n],
        vec![0.0; n],
        Vec::new(),
        Vec::new(),
    )
    .expect("switch");
    let trees = LocalTrees::new(
        0,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 3,
                switch: None,
            },
            TreeBlock {
                tree: tree_c(),
                len: 1,
                switch: Some(collapse),
            },
        ],
    )
    .expect("trees");
    let seqs = Sequences::from_strs(&["ACGT", "ACGT", "ACCT", "ACGA"]).expect("seqs");
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let fwd = forward_algorithm(&list, &model, None, false).expect("forward");
    assert_eq!(fwd.col(3)[0], 1.0);

    assert!(max_traceback(&list, &fwd, Some(5)).is_err());
    let mut rng = SmallRng::seed_from_u64(5);
    assert!(stochastic_traceback(&list, &fwd, &mut rng, Some(5)).is_err());
    assert!(max_traceback(&list, &fwd, Some(0)).is_ok());
}

#[test]
fn dead_switch_fails_forward() {
    let model = test_model();
    let n = 11;
    let dead = TransMatrixSwitch::new(
        n,
        n,
        None,
        None,
        vec![None; n],
        vec![0.0; n],
        Vec::new(),
        Vec::new(),
    )
    .expect("switch");
    let trees = LocalTrees::new(
        0,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 2,
                switch: None,
            },
            TreeBlock {
                tree: tree_c(),
                len: 2,
                switch: Some(dead),
            },
        ],
    )
    .expect("trees");
    let seqs = Sequences::from_strs(&["ACGT", "ACGT", "ACCT", "ACGA"]).expect("seqs");
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let err = forward_algorithm(&list, &model, None, false).expect_err("expected zero column");
    assert!(err.to_string().contains("normalization"));
}

#[test]
fn matrix_list_validates_block_boundaries() {
    let model = test_model();
    let seqs = test_seqs();
    // same leaves, older cherry: 12 states instead of 11
    let tree_d = LocalTree::from_parents(
        &[Some(3), Some(3), Some(4), Some(4), None],
        &[0, 0, 0, 2, 2],
    )
    .expect("tree");
    let no_switch = LocalTrees::new(
        0,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 10,
                switch: None,
            },
            TreeBlock {
                tree: tree_d.clone(),
                len: 5,
                switch: None,
            },
        ],
    )
    .expect("trees");
    assert!(MatrixList::build(&no_switch, &model, &seqs, ThreadMode::Leaf).is_err());

    let wrong_dims = LocalTrees::new(
        0,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 10,
                switch: None,
            },
            TreeBlock {
                tree: tree_d,
                len: 5,
                switch: Some(switch_a_to_c()),
            },
        ],
    )
    .expect("trees");
    assert!(MatrixList::build(&wrong_dims, &model, &seqs, ThreadMode::Leaf).is_err());

    let short = LocalTrees::single(tree_a(), 14).expect("trees");
    assert!(MatrixList::build(&short, &model, &seqs, ThreadMode::Leaf).is_err());

    let trees = LocalTrees::single(tree_a(), 15).expect("trees");
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    assert!(forward_algorithm(&list, &model, Some(&[1.0, 0.0]), false).is_err());
}

#[test]
fn decoding_rejects_states_without_forward_mass() {
    let model = test_model();
    let n = 11;
    let mut determ = vec![Some(5); n];
    determ[1] = Some(1);
    let funnel = TransMatrixSwitch::new(n, n, None, None, determ, vec![0.0; n], Vec::new(), Vec::new())
        .expect("switch");
    let trees = LocalTrees::new(
        0,
        vec![
            TreeBlock {
                tree: tree_a(),
                len: 1,
                switch: None,
            },
            TreeBlock {
                tree: tree_c(),
                len: 1,
                switch: Some(funnel),
            },
        ],
    )
    .expect("trees");
    let seqs = Sequences::from_strs(&["AC", "AC", "AG", "AC"]).expect("seqs");
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let mut prior = vec![0.0; n];
    prior[1] = 1.0;
    let fwd = forward_algorithm(&list, &model, Some(&prior), false).expect("forward");
    assert_eq!(fwd.col(1)[5], 0.0);
    approx_eq(fwd.col(1)[1], 1.0, 1e-15);

    assert!(max_traceback(&list, &fwd, Some(5)).is_err());
    let mut rng = SmallRng::seed_from_u64(9);
    assert!(stochastic_traceback(&list, &fwd, &mut rng, Some(5)).is_err());

    assert_eq!(max_traceback(&list, &fwd, Some(1)).expect("path"), vec![1, 1]);
    assert_eq!(max_traceback(&list, &fwd, None).expect("path"), vec![1, 1]);
}

#[test]
fn supplied_prior_seeds_first_column_unchanged() {
    let model = test_model();
    let trees = three_block_trees();
    let seqs = test_seqs();
    let list = MatrixList::build(&trees, &model, &seqs, ThreadMode::Leaf).expect("matrices");
    let total: f64 = (1..=11).map(|i| i as f64).sum();
    let prior: Vec<f64> = (1..=11).map(|i| i as f64 / total).collect();
    let fwd = forward_algorithm(&list, &model, Some(&prior), false).expect("forward");
    assert_eq!(fwd.col(0), prior.as_slice());
    approx_eq(fwd.col(1).iter().sum::<f64>(), 1.0, 1e-12);

    let mut bad = prior.clone();
    bad[0] = -0.1;
    assert!(forward_algorithm(&list, &model, Some(&bad), false).is_err());
}

#[test]
fn shared_switch_source_adds_both_rows() {
    let sw = TransMatrixSwitch::new(
        2,
        2,
        Some(0),
        Some(0),
        vec![None, Some(1)],
        vec![f64::NEG_INFINITY, 0.0],
        vec![0.25f64.ln(), 0.75f64.ln()],
        vec![0.5f64.ln(), 0.5f64.ln()],
    )
    .expect("switch");
    approx_eq(sw.get(0, 0), 0.75, 1e-12);
    approx_eq(sw.get(0, 1), 1.25, 1e-12);
    approx_eq(sw.get(1, 1), 1.0, 1e-12);
    assert_eq!(sw.get(1, 0), 0.0);

    let col = forward_switch(&[1.0, 0.0], &sw, &[1.0, 1.0], 0).expect("switch column");
    approx_eq(col[0], 0.375, 1e-12);
    approx_eq(col[1], 0.625, 1e-12);
}
