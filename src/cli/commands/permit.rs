use crate::auth::{implies, Permission, Principal};
use crate::cli::args::PermitArgs;
use anyhow::{Context, Result};

/// Print `granted` or `denied` for a single implication check.
pub fn run_permit(args: PermitArgs) -> Result<()> {
    let granted: Permission = args
        .granted
        .parse()
        .with_context(|| format!("invalid granted permission {:?}", args.granted))?;
    let required: Permission = args
        .required
        .parse()
        .with_context(|| format!("invalid required permission {:?}", args.required))?;
    let principal = Principal {
        partition: args.partition,
        username: args.username,
        client_id: args.client_id,
    };
    let verdict = if implies(&granted, &required, &principal, args.case_sensitive) {
        "granted"
    } else {
        "denied"
    };
    println!("{verdict}");
    Ok(())
}
