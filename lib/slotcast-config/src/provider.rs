use std::{marker::PhantomData, path::Path};

use figment::{
    providers::{Data, Format},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A file-backed provider whose contents were read and parsed up front.
///
/// `figment` silently skips missing files and defers parse errors until extraction, which is not what we want when a
/// file was explicitly requested, so the file is loaded eagerly instead.
pub struct FileProvider<F> {
    data: Map<Profile, Dict>,
    metadata: Metadata,
    _format: PhantomData<F>,
}

impl<F: Format> FileProvider<F> {
    pub fn load<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let data = Data::<F>::string(&contents).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from(format!("{} file", F::NAME), path),
            _format: PhantomData,
        })
    }
}

impl<F: Format> Provider for FileProvider<F> {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
