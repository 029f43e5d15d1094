//! CLI arguments to tune how InstanceSets are rolled out and reported.
//!
//! ### Embed into an operator argument set
//!
//! ```rust
//! use clap::Parser;
//! use stackable_instanceset::{
//!     cli::InstanceSetOptions, logging::initialize_logging, plan::UpdatePlanOptions,
//!     reconcile::UpdateReconciler,
//! };
//!
//! #[derive(clap::Parser, Debug, PartialEq, Eq)]
//! struct Run {
//!     #[clap(long)]
//!     name: String,
//!
//!     #[clap(flatten)]
//!     instance_set: InstanceSetOptions,
//! }
//!
//! let run = Run::parse_from(["run", "--name", "kafka", "--log-format", "json"]);
//! initialize_logging("INSTANCESET_LOG", "instanceset", run.instance_set.log_format)
//!     .expect("logging is initialized once");
//! let _update = UpdateReconciler::new(UpdatePlanOptions::from(&run.instance_set));
//! ```

use clap::Args;

use crate::{logging::LogFormat, plan::UpdatePlanOptions, status::StatusOptions};

#[derive(Clone, Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "InstanceSet Options")]
pub struct InstanceSetOptions {
    /// Treat ready instances as serving their role during a serial update, as long as no instance
    /// ever reported a role.
    ///
    /// Some products only report roles once a quorum has formed. Without this, a serial update of
    /// such a product never gets past its first instance.
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub serial_update_skip_unprobed_roles: bool,

    /// The minimum delay before the status is computed again while instances are waiting to
    /// become available, e.g. `500ms` or `5s`.
    #[arg(long, env, default_value = "1s")]
    pub availability_requeue_floor: humantime::Duration,

    /// The format of the log output.
    #[arg(long, env, value_enum, default_value_t)]
    pub log_format: LogFormat,
}

impl Default for InstanceSetOptions {
    fn default() -> Self {
        Self {
            serial_update_skip_unprobed_roles: UpdatePlanOptions::default()
                .serial_skip_unprobed_roles,
            availability_requeue_floor: StatusOptions::default().availability_requeue_floor.into(),
            log_format: LogFormat::default(),
        }
    }
}

impl From<&InstanceSetOptions> for UpdatePlanOptions {
    fn from(options: &InstanceSetOptions) -> Self {
        Self {
            serial_skip_unprobed_roles: options.serial_update_skip_unprobed_roles,
        }
    }
}

impl From<&InstanceSetOptions> for StatusOptions {
    fn from(options: &InstanceSetOptions) -> Self {
        Self {
            availability_requeue_floor: *options.availability_requeue_floor,
        }
    }
}
