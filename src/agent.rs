//! ssh-agent authentication.
//!
//! Every identity the agent holds is offered in turn; the agent signs the
//! server's challenge, so passphrase-protected keys work once `ssh-add`ed.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ssh::ClientHandler;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Signs through the agent. The requested key is cloned before the await so
/// the signing future only holds owned data and stays `Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

#[cfg(unix)]
async fn connect_agent() -> Option<DynAgent> {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        debug!("SSH_AUTH_SOCK not set, skipping ssh-agent");
        return None;
    }
    match AgentClient::connect_env().await {
        Ok(agent) => Some(agent.dynamic()),
        Err(e) => {
            debug!("Could not reach ssh-agent: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
async fn connect_agent() -> Option<DynAgent> {
    None
}

/// Offer each agent identity. Returns `Ok(false)` when there is no agent or
/// none of its keys was accepted, so the caller can fall back to key files.
pub(crate) async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    let Some(mut agent) = connect_agent().await else {
        return Ok(false);
    };

    let keys = match agent.request_identities().await {
        Ok(keys) => keys,
        Err(e) => {
            debug!("Failed to list ssh-agent keys: {}", e);
            return Ok(false);
        }
    };
    debug!("ssh-agent offers {} key(s)", keys.len());

    let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();

    for key in keys {
        let hash_alg = if key.algorithm().is_rsa() {
            rsa_hash
        } else {
            None
        };
        let comment = key.comment().to_string();
        let mut signer = AgentSigner { agent: &mut agent };

        match handle
            .authenticate_publickey_with(user, key, hash_alg, &mut signer)
            .await
        {
            Ok(result) if result.success() => {
                info!("Authenticated with ssh-agent key {}", comment);
                return Ok(true);
            }
            Ok(_) => debug!("Agent key {} rejected by server", comment),
            Err(e) => warn!("Agent signing failed for key {}: {}", comment, e),
        }
    }

    Ok(false)
}
