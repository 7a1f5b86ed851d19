//! Glue between the stored authoritative material and the offline
//! re-simulator. Pure: status decisions and the comparison report are
//! computed from the source alone, so re-running a verification with the
//! same seed and game always produces identical content.

use core_types::{PrngStatus, VerificationReport};
use prng_verifier::{compare, simulate, GeneratorVersion};
use storage_mongo::VerificationSource;

pub fn evaluate_verification(
    source: &VerificationSource,
) -> (PrngStatus, Option<VerificationReport>) {
    let Some(seed) = source.server_seed.as_deref() else {
        return (PrngStatus::AwaitingSeed, None);
    };
    if source.prices.is_empty() {
        return (PrngStatus::MissingExpected, None);
    }

    let version = GeneratorVersion::from_label(source.version.as_deref());
    let sim = simulate(seed, &source.game_id, version);
    let expected_peak = source.peak_multiplier.unwrap_or_else(|| {
        source
            .prices
            .iter()
            .copied()
            .fold(f64::MIN, f64::max)
            .max(0.0)
    });
    let report = compare(&source.prices, expected_peak, &sim);
    let status = if report.prng_verified {
        PrngStatus::Verified
    } else {
        PrngStatus::Failed
    };
    (status, Some(report))
}
