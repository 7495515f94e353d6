//! FHIR resource model, validation and the downstream client

pub mod client;
pub mod resource;
pub mod validation;

pub use client::{EntryResponse, FhirClient, FhirClientConfig, HttpFhirClient, SubmitResponse};
pub use resource::{ParseError, Resource};
pub use validation::{has_errors, validate, Severity, ValidationIssue};
