/// Holds at most one connected client
///
/// A second connection is never queued and never replaces the bound one:
/// [`ClientSlot::bind`] hands it back so the caller can close it.
#[derive(Debug)]
pub struct ClientSlot<S> {
    client: Option<S>,
}

impl<S> Default for ClientSlot<S> {
    fn default() -> Self {
        Self { client: None }
    }
}

impl<S> ClientSlot<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, stream: S) -> Result<(), S> {
        if self.client.is_some() {
            return Err(stream);
        }
        self.client = Some(stream);
        Ok(())
    }

    pub fn release(&mut self) -> Option<S> {
        self.client.take()
    }

    pub fn is_bound(&self) -> bool {
        self.client.is_some()
    }

    pub fn get(&self) -> Option<&S> {
        self.client.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.client.as_mut()
    }
}
