//! Agent token helper: `berth token`.

use berth::server::auth::hash_token;

use super::super::TokenCommands;

pub fn cmd_token(command: TokenCommands) {
    match command {
        TokenCommands::Hash { token } => println!("{}", hash_token(&token)),
    }
}
