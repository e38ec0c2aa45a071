// Project data model
//
// A project holds the generated artifact, the conversation log, build progress
// and the backend connection. The active build job is its only writer.

mod types;

pub use types::{
    BackendConnection, BackendCredentials, BuildState, CodeArtifact, ImageAttachment,
    ManagedBackend, Message, Project, ProjectId, ProjectStatus, ProvisioningStatus, Role,
};
