use clap::Parser;

/// Command-line options for retromail.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Run the OAuth sign-in flow even if an account is already stored.
    #[arg(long)]
    pub sign_in: bool,

    /// Sign out: forget tokens, delete the cache and the stored account.
    #[arg(long)]
    pub sign_out: bool,

    /// Skip the network sync (show cached mail only).
    #[arg(long)]
    pub no_sync: bool,

    /// Stay running and sync whenever IDLE reports new mail (Ctrl-C to quit).
    #[arg(long)]
    pub watch: bool,

    /// Fetch the next batch of older Inbox messages.
    #[arg(long)]
    pub load_more: bool,

    /// Print the folder list.
    #[arg(long)]
    pub folders: bool,

    /// Print the newest messages of another folder (e.g. "[Gmail]/Sent Mail").
    #[arg(long, value_name = "PATH")]
    pub browse: Option<String>,

    /// Print an Inbox message and mark it read.
    #[arg(long, value_name = "UID")]
    pub read: Option<u32>,

    /// Move an Inbox message to the Trash.
    #[arg(long, value_name = "UID")]
    pub trash: Option<u32>,

    /// Move an Inbox message to the folder given by --to.
    #[arg(long = "move", value_name = "UID", requires = "to")]
    pub move_uid: Option<u32>,

    /// Destination folder for --move.
    #[arg(long, value_name = "PATH")]
    pub to: Option<String>,

    /// Send a message to these recipients (repeatable).
    #[arg(long, value_name = "ADDR")]
    pub send_to: Vec<String>,

    #[arg(long, value_name = "ADDR")]
    pub cc: Vec<String>,

    #[arg(long, value_name = "ADDR")]
    pub bcc: Vec<String>,

    #[arg(long, default_value = "")]
    pub subject: String,

    #[arg(long, default_value = "")]
    pub body: String,

    /// How many messages to list.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

/// How to get an account before doing anything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Startup {
    UseStored,
    SignIn,
    NotSignedIn,
}

impl Cli {
    pub fn startup(&self, has_account: bool) -> Startup {
        match (has_account, self.sign_out) {
            (false, true) => Startup::NotSignedIn,
            (true, true) => Startup::UseStored,
            (true, false) if !self.sign_in => Startup::UseStored,
            _ => Startup::SignIn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_requires_destination() {
        assert!(Cli::try_parse_from(["retromail", "--move", "5"]).is_err());
        let cli = Cli::try_parse_from(["retromail", "--move", "5", "--to", "Receipts"]).unwrap();
        assert_eq!(cli.move_uid, Some(5));
        assert_eq!(cli.to.as_deref(), Some("Receipts"));
    }

    #[test]
    fn sign_out_without_account_never_signs_in() {
        let cli = Cli::try_parse_from(["retromail", "--sign-out"]).unwrap();
        assert_eq!(cli.startup(false), Startup::NotSignedIn);
        assert_eq!(cli.startup(true), Startup::UseStored);
    }

    #[test]
    fn sign_in_is_needed_without_account_or_on_request() {
        let cli = Cli::default();
        assert_eq!(cli.startup(false), Startup::SignIn);
        assert_eq!(cli.startup(true), Startup::UseStored);

        let cli = Cli::try_parse_from(["retromail", "--sign-in"]).unwrap();
        assert_eq!(cli.startup(true), Startup::SignIn);
    }

    #[test]
    fn recipients_repeat() {
        let cli = Cli::try_parse_from([
            "retromail",
            "--send-to",
            "a@example.com",
            "--send-to",
            "b@example.com",
            "--subject",
            "hi",
        ])
        .unwrap();
        assert_eq!(cli.send_to.len(), 2);
        assert_eq!(cli.limit, 10);
    }
}
