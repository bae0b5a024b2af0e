use arghmm_rs::seq::{Base, Sequences, check_seq_name, decode, encode};

#[test]
fn encode_accepts_both_cases_and_rejects_unknown() {
    let seq = encode("ACgtNn").expect("failed to encode");
    assert_eq!(
        seq,
        vec![Base::A, Base::C, Base::G, Base::T, Base::N, Base::N]
    );
    assert_eq!(decode(&seq), "ACGTNN");

    let err = encode("ACXT").expect_err("expected invalid char error");
    assert!(err.to_string().contains("unknown char 'X'"));
}

#[test]
fn ambiguous_base_is_all_ones_not_uniform() {
    assert_eq!(Base::N.likelihood(), [1.0; 4]);
    assert_eq!(Base::G.likelihood(), [0.0, 0.0, 1.0, 0.0]);
    assert_eq!(Base::N.fitch_set(), 0b1111);
    assert_eq!(Base::T.fitch_set(), 0b1000);
    assert_eq!(Base::C.index(), Some(1));
    assert_eq!(Base::N.index(), None);
}

#[test]
fn sequences_enforce_equal_lengths() {
    let mut seqs = Sequences::new();
    seqs.push("a", "ACGT").expect("push a");
    let err = seqs.push("b", "ACG").expect_err("expected length mismatch");
    assert!(err.to_string().contains("not the same length"));
    assert_eq!(seqs.num_seqs(), 1);
    assert_eq!(seqs.len(), 4);
}

#[test]
fn invariant_sites_need_one_unambiguous_base() {
    let seqs = Sequences::from_strs(&["AACN", "AAGN", "ANCN"]).expect("seqs");
    let view = seqs.full_view();
    assert_eq!(view.invariant_sites(), vec![true, false, false, false]);

    let sub = seqs.view(1..3).expect("view");
    assert_eq!(sub.len(), 2);
    assert_eq!(sub.base(1, 1), Base::G);
    assert!(seqs.view(2..5).is_err());
}

#[test]
fn seq_names_are_validated() {
    assert!(check_seq_name("sample_1.a-b c").is_ok());
    assert!(check_seq_name("").is_err());
    assert!(check_seq_name(" lead").is_err());
    assert!(check_seq_name("trail ").is_err());
    assert!(check_seq_name("bad/name").is_err());
    assert!(check_seq_name("12345").is_err());
}
