use std::sync::Arc;

use derive_where::derive_where;

use crate::{
    cmap::{ConnectionPool, PoolFactory},
    options::ServerAddress,
};

/// The live state for a server in the topology: its address and the connection pool that
/// operations check connections out of. The topology owns each `Server` exclusively; selected
/// servers hand out clones of the inner `Arc`.
#[derive_where(Debug)]
pub struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    #[derive_where(skip)]
    pub(crate) pool: Arc<dyn ConnectionPool>,
}

impl Server {
    /// Create a new reference counted `Server`, including its connection pool.
    pub(crate) fn new(address: ServerAddress, pool_factory: &dyn PoolFactory) -> Arc<Server> {
        Arc::new(Self {
            pool: pool_factory.build(address.clone()),
            address,
        })
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The connection pool for this server.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }
}
