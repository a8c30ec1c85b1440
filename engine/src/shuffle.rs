use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// Keep the operator's order.
    #[default]
    None,
    /// Plain Fisher–Yates.
    Random,
    /// Fisher–Yates over files outside the recency window, recent files last.
    Smart,
}

/// Reorders `files` in place according to `mode`.
///
/// `history` is the playlist's recency history (oldest first). Smart mode may
/// truncate it when every file is inside the window.
pub fn shuffle_files(
    mode: ShuffleMode,
    files: &mut Vec<String>,
    history: &mut VecDeque<String>,
    rng: &mut fastrand::Rng,
) {
    match mode {
        ShuffleMode::None => {}
        ShuffleMode::Random => rng.shuffle(files),
        ShuffleMode::Smart => *files = smart_shuffle(files, history, rng),
    }
}

pub fn smart_shuffle(files: &[String], history: &mut VecDeque<String>, rng: &mut fastrand::Rng) -> Vec<String> {
    if files.is_empty() {
        return Vec::new();
    }

    for _ in 0..2 {
        let recent: HashSet<&str> = history.iter().map(String::as_str).collect();
        let (mut eligible, ineligible): (Vec<String>, Vec<String>) =
            files.iter().cloned().partition(|f| !recent.contains(f.as_str()));

        if !eligible.is_empty() {
            rng.shuffle(&mut eligible);
            eligible.extend(ineligible);
            return eligible;
        }

        // The window covers the whole catalog. Keep only the most recent entry.
        while history.len() > 1 {
            history.pop_front();
        }
    }

    // Single distinct file: there is only one arrangement worth having.
    let mut out = files.to_vec();
    rng.shuffle(&mut out);
    out
}

/// Pushes a file that just began playing onto the history.
///
/// Already-present files are left where they are.
pub fn record_played(history: &mut VecDeque<String>, file: &str, window: usize) {
    if !history.iter().any(|f| f == file) {
        history.push_back(file.to_string());
    }
    trim_history(history, window);
}

pub fn trim_history(history: &mut VecDeque<String>, window: usize) {
    while history.len() > window {
        history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/media/clip{i:02}.mp4")).collect()
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn both_strategies_permute_the_multiset() {
        let mut files = names(6);
        files.push(files[2].clone());

        for seed in 0..50 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut history: VecDeque<String> = files[..3].iter().cloned().collect();

            let mut plain = files.clone();
            shuffle_files(ShuffleMode::Random, &mut plain, &mut history, &mut rng);
            assert_eq!(sorted(plain), sorted(files.clone()));

            let mut smart = files.clone();
            shuffle_files(ShuffleMode::Smart, &mut smart, &mut history, &mut rng);
            assert_eq!(sorted(smart), sorted(files.clone()));
        }
    }

    #[test]
    fn smart_shuffle_keeps_recent_files_out_of_the_front() {
        let files = names(10);
        let window = 4;

        for seed in 0..200u64 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let take = (seed as usize) % (window + 1);
            let picks: Vec<String> = (0..take).map(|i| files[(i * 3 + seed as usize) % files.len()].clone()).collect();
            let mut history = VecDeque::new();
            for p in &picks {
                record_played(&mut history, p, window);
            }
            let before = history.clone();

            let out = smart_shuffle(&files, &mut history, &mut rng);
            for f in &out[..files.len() - window] {
                assert!(!before.contains(f), "seed {seed}: {f} was recent");
            }
        }
    }

    #[test]
    fn smart_shuffle_keeps_prior_order_of_recent_files() {
        let files = names(5);
        let mut history: VecDeque<String> = VecDeque::from(vec![files[3].clone(), files[1].clone()]);
        let mut rng = fastrand::Rng::with_seed(7);

        let out = smart_shuffle(&files, &mut history, &mut rng);
        assert_eq!(&out[3..], &[files[1].clone(), files[3].clone()]);
    }

    #[test]
    fn smart_shuffle_truncates_history_when_window_covers_catalog() {
        let files = names(3);
        let mut history: VecDeque<String> = files.iter().cloned().collect();
        let mut rng = fastrand::Rng::with_seed(1);

        let out = smart_shuffle(&files, &mut history, &mut rng);
        assert_eq!(history, VecDeque::from(vec![files[2].clone()]));
        assert_eq!(out.last(), Some(&files[2]));
        assert_eq!(sorted(out), files);
    }

    #[test]
    fn smart_shuffle_of_a_single_recent_file_terminates() {
        let files = names(1);
        let mut history: VecDeque<String> = files.iter().cloned().collect();
        let mut rng = fastrand::Rng::with_seed(3);
        assert_eq!(smart_shuffle(&files, &mut history, &mut rng), files);
        assert!(smart_shuffle(&[], &mut history, &mut rng).is_empty());
    }

    #[test]
    fn none_mode_keeps_order() {
        let mut files = names(4);
        let mut history = VecDeque::new();
        let mut rng = fastrand::Rng::with_seed(9);
        shuffle_files(ShuffleMode::None, &mut files, &mut history, &mut rng);
        assert_eq!(files, names(4));
    }

    #[test]
    fn history_skips_duplicates_and_stays_within_window() {
        let mut history = VecDeque::new();
        record_played(&mut history, "a", 3);
        record_played(&mut history, "b", 3);
        record_played(&mut history, "a", 3);
        assert_eq!(history, VecDeque::from(vec!["a".to_string(), "b".to_string()]));

        record_played(&mut history, "c", 3);
        record_played(&mut history, "d", 3);
        assert_eq!(history, VecDeque::from(vec!["b".to_string(), "c".to_string(), "d".to_string()]));

        record_played(&mut history, "e", 0);
        assert!(history.is_empty());
    }
}
