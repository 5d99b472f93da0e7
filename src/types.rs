//! Resolution of stored type identifiers.
//!
//! The storage engine keeps job payloads as opaque JSON text next to two
//! string identifiers. A [`TypeRegistry`] turns those strings back into a
//! [`JobType`] and a decoded [`Payload`]. It is populated at startup through
//! [`JobRegistry::register`](crate::JobRegistry::register).

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{RegistryError, ResolveError};
use crate::task::{JobType, Payload};

/// A job payload that can be stored and decoded by type identifier.
pub trait JobData: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Unique identifier of the payload type.
    ///
    /// This is written to the database, so changing it orphans stored jobs.
    const DATA_TYPE: &'static str;
}

type DecodeFn = fn(&str) -> Result<Payload, serde_json::Error>;

#[derive(Debug, Clone, Copy)]
struct Decoder {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

fn decode<T: JobData>(raw: &str) -> Result<Payload, serde_json::Error> {
    let data: T = serde_json::from_str(raw)?;
    Ok(Arc::new(data))
}

/// Maps stored type identifiers to job types and payload decoders.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    job_types: HashMap<&'static str, JobType>,
    decoders: HashMap<&'static str, Decoder>,
}

impl TypeRegistry {
    /// Adds `job_type` with payload type `T`.
    ///
    /// Nothing is changed if either identifier is already taken by a
    /// different registration. Several job types may share one payload type.
    pub(crate) fn insert<T: JobData>(&mut self, job_type: &'static str) -> Result<(), RegistryError> {
        if let Some(existing) = self.job_types.get(job_type) {
            return Err(RegistryError::DuplicateJobType {
                job_type,
                data_type: existing.data_type,
            });
        }
        let conflict = self
            .decoders
            .get(T::DATA_TYPE)
            .filter(|existing| existing.type_id != TypeId::of::<T>());
        if let Some(existing) = conflict {
            return Err(RegistryError::DataTypeConflict {
                data_type: T::DATA_TYPE,
                registered: existing.type_name,
                rejected: type_name::<T>(),
            });
        }

        self.job_types.insert(
            job_type,
            JobType {
                name: job_type,
                data_type: T::DATA_TYPE,
            },
        );
        self.decoders.insert(
            T::DATA_TYPE,
            Decoder {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                decode: decode::<T>,
            },
        );
        Ok(())
    }

    /// Looks up a job type by identifier.
    pub fn job_type(&self, job_type: &str) -> Result<JobType, ResolveError> {
        self.job_types
            .get(job_type)
            .copied()
            .ok_or_else(|| ResolveError::UnknownJobType(job_type.to_string()))
    }

    /// Checks both identifiers of a record without decoding its payload.
    pub fn check(&self, job_type: &str, data_type: &str) -> Result<JobType, ResolveError> {
        let resolved = self.job_type(job_type)?;
        if !self.decoders.contains_key(data_type) {
            return Err(ResolveError::UnknownDataType(data_type.to_string()));
        }
        if resolved.data_type != data_type {
            return Err(ResolveError::DataTypeMismatch {
                job_type: job_type.to_string(),
                expected: resolved.data_type,
                found: data_type.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Resolves both identifiers and decodes the payload.
    pub fn resolve(
        &self,
        job_type: &str,
        data_type: &str,
        raw: &str,
    ) -> Result<(JobType, Payload), ResolveError> {
        let resolved = self.check(job_type, data_type)?;
        let decoder = self
            .decoders
            .get(data_type)
            .ok_or_else(|| ResolveError::UnknownDataType(data_type.to_string()))?;
        let payload = (decoder.decode)(raw).map_err(|source| ResolveError::Decode {
            data_type: data_type.to_string(),
            source,
        })?;
        Ok((resolved, payload))
    }

    /// Identifiers of all registered job types.
    pub fn job_types(&self) -> Vec<&'static str> {
        self.job_types.keys().copied().collect()
    }
}
