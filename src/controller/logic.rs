use crate::error::Result;
use crate::protocol::PropertyMap;

/// User control logic run by the service worker.
///
/// `process` may take arbitrarily long; samples that arrive meanwhile
/// replace each other and only the newest one is processed next.
pub trait Controller: Send {
    /// Turns one set of sensor samples into actuation commands.
    fn process(&mut self, samples: &PropertyMap) -> Result<PropertyMap>;
}

/// Builds a controller from the plant's param-role properties.
pub type ControllerFactory = Box<dyn Fn(&PropertyMap) -> Result<Box<dyn Controller>> + Send + Sync>;

impl<F> Controller for F
where
    F: FnMut(&PropertyMap) -> Result<PropertyMap> + Send,
{
    fn process(&mut self, samples: &PropertyMap) -> Result<PropertyMap> {
        self(samples)
    }
}
