//! Per-scheduler command construction and output parsing.
//!
//! Each batch system differs only in its command triplet, submit-output
//! format and queue-listing columns; everything else is shared by
//! `RemoteQueue`. Binary names are user-configurable; the constants here
//! are defaults.

/// Classification of a job id against a queue listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCode {
    Queued,
    Running,
    /// The job does not appear in the listing.
    Unlisted,
    /// Listed, but with a status code this adapter does not recognize.
    Unknown,
}

pub trait SchedulerAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    /// Queue script template filename (`job.pbs`, `job.slurm`, ...).
    fn script_filename(&self) -> &'static str;
    fn default_submit_command(&self) -> &'static str;
    fn default_status_command(&self) -> &'static str;
    fn default_cancel_command(&self) -> &'static str;

    /// Full submit invocation, run from the job's remote directory.
    fn submit_invocation(&self, submit_command: &str) -> String {
        format!("{} {}", submit_command, self.script_filename())
    }

    /// Full queue-listing invocation.
    fn status_invocation(&self, status_command: &str, user: &str) -> String {
        format!("{} -u {}", status_command, user)
    }

    /// Extract the scheduler-assigned job id from submit-command stdout.
    fn parse_job_id(&self, stdout: &str) -> Option<u64>;

    /// Classify `job_id` against the cached queue listing.
    fn classify(&self, lines: &[String], job_id: u64) -> QueueCode;
}

fn leading_digits(token: &str) -> Option<u64> {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn status_field(lines: &[String], job_id: u64, field_index: usize) -> Option<String> {
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let first = match fields.first() {
            Some(f) => *f,
            None => continue,
        };
        if leading_digits(first) == Some(job_id) {
            return fields.get(field_index).map(|s| s.to_string());
        }
    }
    None
}

/// PBS/TORQUE. Submit output is `<jobID>.hostname...`; `qstat -u` lines
/// carry the state in the tenth column (R/E running, Q/H/T/W/S queued).
pub struct Pbs;

impl SchedulerAdapter for Pbs {
    fn name(&self) -> &'static str {
        "PBS"
    }

    fn script_filename(&self) -> &'static str {
        "job.pbs"
    }

    fn default_submit_command(&self) -> &'static str {
        "qsub"
    }

    fn default_status_command(&self) -> &'static str {
        "qstat"
    }

    fn default_cancel_command(&self) -> &'static str {
        "qdel"
    }

    fn parse_job_id(&self, stdout: &str) -> Option<u64> {
        let first = stdout.trim().split('.').next()?;
        leading_digits(first.trim())
    }

    fn classify(&self, lines: &[String], job_id: u64) -> QueueCode {
        match status_field(lines, job_id, 9) {
            None => QueueCode::Unlisted,
            Some(status) => {
                if status.contains(['R', 'E']) {
                    QueueCode::Running
                } else if status.contains(['Q', 'H', 'T', 'W', 'S']) {
                    QueueCode::Queued
                } else {
                    QueueCode::Unknown
                }
            }
        }
    }
}

/// Sun Grid Engine. Shares the qsub/qstat/qdel triplet with PBS but has
/// its state in column five, lowercase.
pub struct Sge;

impl SchedulerAdapter for Sge {
    fn name(&self) -> &'static str {
        "SGE"
    }

    fn script_filename(&self) -> &'static str {
        "job.sh"
    }

    fn default_submit_command(&self) -> &'static str {
        "qsub"
    }

    fn default_status_command(&self) -> &'static str {
        "qstat"
    }

    fn default_cancel_command(&self) -> &'static str {
        "qdel"
    }

    fn parse_job_id(&self, stdout: &str) -> Option<u64> {
        // "Your job 231 ("job.sh") has been submitted"
        stdout
            .split_whitespace()
            .find_map(|token| token.parse::<u64>().ok())
    }

    fn classify(&self, lines: &[String], job_id: u64) -> QueueCode {
        match status_field(lines, job_id, 4) {
            None => QueueCode::Unlisted,
            Some(status) => {
                if status.contains('r') || status.contains('t') {
                    QueueCode::Running
                } else if status.contains(['q', 'w', 's', 'h']) {
                    QueueCode::Queued
                } else {
                    QueueCode::Unknown
                }
            }
        }
    }
}

/// LSF. Submission reads the script from stdin; submit output is
/// `Job <1659> is submitted to queue <normal>`.
pub struct Lsf;

impl SchedulerAdapter for Lsf {
    fn name(&self) -> &'static str {
        "LSF"
    }

    fn script_filename(&self) -> &'static str {
        "job.lsf"
    }

    fn default_submit_command(&self) -> &'static str {
        "bsub"
    }

    fn default_status_command(&self) -> &'static str {
        "bjobs"
    }

    fn default_cancel_command(&self) -> &'static str {
        "bkill"
    }

    fn submit_invocation(&self, submit_command: &str) -> String {
        format!("{} < {}", submit_command, self.script_filename())
    }

    fn parse_job_id(&self, stdout: &str) -> Option<u64> {
        let start = stdout.find('<')? + 1;
        let end = stdout[start..].find('>')? + start;
        stdout[start..end].parse().ok()
    }

    fn classify(&self, lines: &[String], job_id: u64) -> QueueCode {
        match status_field(lines, job_id, 2) {
            None => QueueCode::Unlisted,
            Some(status) => {
                // DONE/EXIT jobs are treated as running; the follow-up
                // poll sees them leave the listing and checks the output.
                if ["RUN", "DONE", "EXIT"].iter().any(|s| status.contains(s)) {
                    QueueCode::Running
                } else if ["PEND", "PSUSP", "USUSP", "SSUSP", "WAIT"]
                    .iter()
                    .any(|s| status.contains(s))
                {
                    QueueCode::Queued
                } else {
                    QueueCode::Unknown
                }
            }
        }
    }
}

/// SLURM. Submit output is `Submitted batch job <jobid>`; `squeue` lines
/// carry the state code in column five.
pub struct Slurm;

impl SchedulerAdapter for Slurm {
    fn name(&self) -> &'static str {
        "SLURM"
    }

    fn script_filename(&self) -> &'static str {
        "job.slurm"
    }

    fn default_submit_command(&self) -> &'static str {
        "sbatch"
    }

    fn default_status_command(&self) -> &'static str {
        "squeue"
    }

    fn default_cancel_command(&self) -> &'static str {
        "scancel"
    }

    fn parse_job_id(&self, stdout: &str) -> Option<u64> {
        stdout
            .trim()
            .split_whitespace()
            .last()
            .and_then(leading_digits)
    }

    fn classify(&self, lines: &[String], job_id: u64) -> QueueCode {
        match status_field(lines, job_id, 4) {
            None => QueueCode::Unlisted,
            Some(status) => {
                // Completing/cancelled/failed codes count as running: the
                // job leaves the listing next refresh and the output check
                // decides the outcome.
                if ["CA", "CD", "CG", "F", "NF", "R", "S", "TO"]
                    .iter()
                    .any(|s| status.contains(s))
                {
                    QueueCode::Running
                } else if ["CF", "PD"].iter().any(|s| status.contains(s)) {
                    QueueCode::Queued
                } else {
                    QueueCode::Unknown
                }
            }
        }
    }
}

/// IBM LoadLeveler. Job steps are listed as `host.<jobid>.<step>`; the
/// state letter follows the date/time columns.
pub struct LoadLeveler;

impl SchedulerAdapter for LoadLeveler {
    fn name(&self) -> &'static str {
        "LoadLeveler"
    }

    fn script_filename(&self) -> &'static str {
        "job.ll"
    }

    fn default_submit_command(&self) -> &'static str {
        "llsubmit"
    }

    fn default_status_command(&self) -> &'static str {
        "llq"
    }

    fn default_cancel_command(&self) -> &'static str {
        "llcancel"
    }

    fn parse_job_id(&self, stdout: &str) -> Option<u64> {
        // `llsubmit: The job "host.498" has been submitted.`
        let quoted = stdout.split('"').nth(1)?;
        quoted.rsplit('.').find_map(|part| part.parse::<u64>().ok())
    }

    fn classify(&self, lines: &[String], job_id: u64) -> QueueCode {
        let needle = format!(".{}.", job_id);
        let tail = format!(".{}", job_id);
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let first = match fields.first() {
                Some(f) => *f,
                None => continue,
            };
            if !(first.contains(&needle) || first.ends_with(&tail)) {
                continue;
            }
            // Id Owner Submitted(date) Submitted(time) ST ...
            return match fields.get(4) {
                Some(&"R") | Some(&"ST") | Some(&"P") => QueueCode::Running,
                Some(&"I") | Some(&"Q") | Some(&"H") | Some(&"NQ") | Some(&"E") => {
                    QueueCode::Queued
                }
                _ => QueueCode::Unknown,
            };
        }
        QueueCode::Unlisted
    }
}
