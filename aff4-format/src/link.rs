use crate::attrs;
use crate::error::Result;
use crate::object::{Mode, Object, ObjectType};
use crate::resolver::Resolver;
use crate::urn::Urn;

/// An alias for another object.
///
/// [`Resolver::open`] follows links before dispatching on type, so a
/// `Link` object is only ever seen while it is being created.
#[derive(Debug)]
pub struct Link {
    urn: Urn,
    mode: Mode,
    resolver: Resolver,
    target: Urn,
}

impl Link {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let target = resolver.require_urn(urn, attrs::TARGET)?;
        Ok(Box::new(Link {
            urn: urn.clone(),
            mode,
            resolver: resolver.clone(),
            target,
        }))
    }

    /// Make `link` an alias of `target`, recorded in `volume`.
    ///
    /// The link is persisted the next time `volume` is closed.
    pub fn create(resolver: &Resolver, link: &Urn, target: &Urn, volume: &Urn) -> Result<()> {
        resolver
            .create(ObjectType::Link)
            .urn(link.clone())
            .set(attrs::TARGET, target)
            .set(attrs::STORED, volume)
            .finish_as::<Link>()?
            .close()
    }

    pub fn target(&self) -> &Urn {
        &self.target
    }
}

impl Object for Link {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Link
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write {
            return Ok(());
        }
        if let Some(volume) = self.resolver.resolve_urn(&self.urn, attrs::STORED) {
            self.resolver.set(&volume, attrs::DIRTY, 1u64);
        }
        tracing::debug!(link = %self.urn, target = %self.target, "created link");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use crate::volume::ZipVolume;
    use std::io::Read;

    #[test]
    fn opening_a_link_yields_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_path(dir.path().join("link.zip")).unwrap();
        let resolver = Resolver::default();
        let volume = ZipVolume::create_in(&resolver, &backing).unwrap();
        let volume_urn = volume.urn().clone();
        volume.close().unwrap();

        let mut segment = Segment::create_in(&resolver, &volume_urn, "target").unwrap();
        std::io::Write::write_all(&mut *segment, b"linked").unwrap();
        let target = segment.urn().clone();
        segment.close().unwrap();

        let alias = Urn::new("aff4://alias");
        Link::create(&resolver, &alias, &target, &volume_urn).unwrap();
        resolver.flush().unwrap();

        let fresh = Resolver::default();
        ZipVolume::load_from(&fresh, &backing).unwrap();
        let mut opened = fresh.open(&alias, Mode::Read).unwrap();
        assert_eq!(opened.urn(), &target);
        let mut text = String::new();
        opened.stream().unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "linked");
        fresh.cache_return(opened);
    }
}
