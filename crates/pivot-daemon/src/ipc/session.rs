//! Per-connection agent protocol session

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, AddSmartcardKeyConstrained, Extension, Identity,
    ProtoError, RemoveIdentity, SignRequest, SmartcardKey,
};
use ssh_key::Signature;
use tracing::{debug, warn};

use pivot_core::{Error, SignatureFlags};

use crate::agent::PivAgent;

/// SSH_AGENTC_EXTENSION
const EXTENSION_COMMAND: u8 = 27;

/// Adapts agent protocol requests to the agent core
#[derive(Clone)]
pub struct AgentSession {
    agent: PivAgent,
}

impl AgentSession {
    pub fn new(agent: PivAgent) -> Self {
        Self { agent }
    }
}

/// Convert an agent error for the wire
///
/// Clients only ever see a failure; the cause is logged here. Unsupported
/// extensions get the protocol's own "unsupported" answer.
fn protocol_error(request: &str, error: Error) -> AgentError {
    match error {
        Error::ExtensionUnsupported => {
            debug!(request, "Extension unsupported");
            AgentError::Proto(ProtoError::UnsupportedCommand {
                command: EXTENSION_COMMAND,
            })
        }
        other => {
            warn!(request, "Request failed: {}", other);
            AgentError::other(other)
        }
    }
}

#[ssh_agent_lib::async_trait]
impl Session for AgentSession {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let keys = self
            .agent
            .list_keys()
            .await
            .map_err(|e| protocol_error("list", e))?;
        Ok(keys
            .into_iter()
            .map(|record| Identity {
                pubkey: record.key,
                comment: record.comment,
            })
            .collect())
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        self.agent
            .sign_with_flags(
                request.pubkey,
                request.data,
                SignatureFlags::from_bits(request.flags),
            )
            .await
            .map_err(|e| protocol_error("sign", e))
    }

    async fn add_identity(&mut self, _identity: AddIdentity) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("add identity")
            .map_err(|e| protocol_error("add identity", e))
    }

    async fn add_identity_constrained(
        &mut self,
        _identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("add constrained identity")
            .map_err(|e| protocol_error("add constrained identity", e))
    }

    async fn remove_identity(&mut self, _identity: RemoveIdentity) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("remove identity")
            .map_err(|e| protocol_error("remove identity", e))
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.agent
            .remove_all()
            .await
            .map_err(|e| protocol_error("remove all identities", e))
    }

    async fn add_smartcard_key(&mut self, _key: SmartcardKey) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("add smartcard key")
            .map_err(|e| protocol_error("add smartcard key", e))
    }

    async fn add_smartcard_key_constrained(
        &mut self,
        _key: AddSmartcardKeyConstrained,
    ) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("add constrained smartcard key")
            .map_err(|e| protocol_error("add constrained smartcard key", e))
    }

    async fn remove_smartcard_key(&mut self, _key: SmartcardKey) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("remove smartcard key")
            .map_err(|e| protocol_error("remove smartcard key", e))
    }

    async fn lock(&mut self, _key: String) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("lock")
            .map_err(|e| protocol_error("lock", e))
    }

    async fn unlock(&mut self, _key: String) -> Result<(), AgentError> {
        self.agent
            .reject_mutation("unlock")
            .map_err(|e| protocol_error("unlock", e))
    }

    async fn extension(&mut self, extension: Extension) -> Result<Option<Extension>, AgentError> {
        self.agent
            .reject_extension(&extension.name)
            .map(|_| None)
            .map_err(|e| protocol_error("extension", e))
    }
}
