//! Generated train job names.

use rand::Rng;

/// Length of a generated name.
pub const JOB_NAME_LENGTH: usize = 12;

/// Generates a job name: one lowercase letter followed by 11 hex characters.
///
/// The leading letter keeps the name a valid DNS label.
#[must_use]
pub fn generate_job_name() -> String {
    let first = char::from(rand::thread_rng().gen_range(b'a'..=b'z'));
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{first}{}", &suffix[..JOB_NAME_LENGTH - 1])
}
