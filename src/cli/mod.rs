//! Command-line interface definitions for the `hrobot` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `hrobot` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hrobot",
    about = "Order, image, and configure bare-metal servers through the Robot API",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create or update a managed server from a JSON declaration.
    #[command(name = "apply")]
    Apply(FileArgs),
    /// Release a managed server and request its cancellation.
    #[command(name = "destroy")]
    Destroy(NameArgs),
    /// Reconcile stored state with the provider's server listing.
    #[command(name = "refresh")]
    Refresh(NameArgs),
    /// Place a standard or market order from a JSON declaration.
    #[command(name = "order")]
    Order(FileArgs),
    /// Show an order transaction, refreshing it while it is in process.
    #[command(name = "transaction")]
    Transaction(TransactionArgs),
    /// List every server on the account.
    #[command(name = "servers")]
    Servers,
    /// Manage virtual switches.
    #[command(subcommand)]
    Vswitch(VSwitchCommand),
}

/// A declaration file argument.
#[derive(Debug, Parser)]
pub(crate) struct FileArgs {
    /// Path to the JSON declaration.
    #[arg(value_name = "FILE")]
    pub(crate) file: String,
}

/// A managed server name argument.
#[derive(Debug, Parser)]
pub(crate) struct NameArgs {
    /// Name of the managed server.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
}

/// Arguments for `hrobot transaction`.
#[derive(Debug, Parser)]
pub(crate) struct TransactionArgs {
    /// Transaction identifier returned when the order was placed.
    #[arg(value_name = "ID")]
    pub(crate) id: String,
    /// Look the transaction up among server market orders.
    #[arg(long)]
    pub(crate) market: bool,
}

/// `hrobot vswitch` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum VSwitchCommand {
    /// Create a virtual switch.
    Create(VSwitchArgs),
    /// Show a virtual switch.
    Get(VSwitchId),
    /// Change the VLAN tag and name of a virtual switch.
    Update {
        /// Switch identifier.
        #[arg(value_name = "ID")]
        id: u32,
        /// New settings.
        #[command(flatten)]
        settings: VSwitchArgs,
    },
    /// Cancel a virtual switch immediately.
    Delete(VSwitchId),
}

/// VLAN tag and name of a virtual switch.
#[derive(Debug, Parser)]
pub(crate) struct VSwitchArgs {
    /// VLAN tag between 4000 and 4091.
    #[arg(long)]
    pub(crate) vlan: u16,
    /// Display name.
    #[arg(long)]
    pub(crate) name: String,
}

/// A virtual switch identifier.
#[derive(Debug, Parser)]
pub(crate) struct VSwitchId {
    /// Switch identifier.
    #[arg(value_name = "ID")]
    pub(crate) id: u32,
}
