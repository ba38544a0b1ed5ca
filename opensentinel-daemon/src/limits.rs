//! File descriptor limit handling.
//!
//! The port fleet needs several thousand sockets (four ranges, two protocols,
//! two families), so the soft `RLIMIT_NOFILE` is raised toward the configured
//! target before any listener opens. Raising past the hard limit is clamped;
//! failures leave the current limit in place.

/// Raise the soft fd limit toward `target` and return the resulting limit.
#[cfg(unix)]
pub fn raise_file_descriptor_limit(target: u64) -> u64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: plain getrlimit/setrlimit calls on a local struct.
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            return target;
        }

        if (limit.rlim_cur as u64) < target {
            limit.rlim_cur = target as libc::rlim_t;
            if limit.rlim_cur > limit.rlim_max {
                limit.rlim_cur = limit.rlim_max;
            }
            libc::setrlimit(libc::RLIMIT_NOFILE, &limit);
            libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit);
        }

        limit.rlim_cur as u64
    }
}

/// Raise the soft fd limit toward `target` and return the resulting limit.
#[cfg(not(unix))]
pub fn raise_file_descriptor_limit(_target: u64) -> u64 {
    2048
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_a_positive_limit() {
        let limit = raise_file_descriptor_limit(16_384);
        assert!(limit > 0);
    }

    #[test]
    fn never_lowers_the_current_limit() {
        let before = raise_file_descriptor_limit(1);
        let after = raise_file_descriptor_limit(1);
        assert!(after >= before.min(1));
        // Asking for a tiny target must not shrink an already-higher limit.
        let high = raise_file_descriptor_limit(16_384);
        assert!(high >= after);
    }
}
