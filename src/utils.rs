/// Relative/absolute float comparison used when checking emission tables
/// against their reference computation.
pub fn fequal(f1: f64, f2: f64, rel: f64, eabs: f64) -> bool {
    if f1 == f2 {
        return true;
    }
    let diff = (f1 - f2).abs();
    if diff < eabs {
        return true;
    }
    let err = if f2 == 0.0 {
        f1.abs()
    } else if f1 == 0.0 {
        f2.abs()
    } else {
        diff / f2.abs()
    };
    err < rel
}

pub fn argmax(vals: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in vals.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
