#![forbid(unsafe_code)]
#![doc = "Peer certificate handling for platls."]

pub mod chain;
pub mod validator;
pub mod x509;

pub use chain::{
    CandidateChain, ChainElement, ChainEngine, ChainSelection, IssuerChainEngine, TrustStatus,
    TrustStores,
};
pub use validator::{
    CertError, ChainValidator, TrustEvaluation, ValidatedChain, ValidationParams, VerifyDecision,
    VerifyPurpose,
};
