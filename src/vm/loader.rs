//! Executable Image Loader
//!
//! The fault handler never looks at the executable format. It asks a
//! [`LazyLoader`] whether a page comes from the image, how it is protected,
//! and to copy its initial bytes into a frame.
//!
//! [`SectionImage`] is the in-memory implementation: an image already split
//! into page-aligned sections, each with file bytes followed by an implicit
//! zero-filled tail (the section's bss).

use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

use super::PAGE_SIZE;
use crate::types::Vpn;

// ============================================================================
// Loader Capability
// ============================================================================

/// Image load failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Page is not part of any section
    #[error("page {0} is not in the image")]
    NotInImage(Vpn),
    /// Section does not start where the previous one ended
    #[error("section {name} starts at page {found}, expected {expected}")]
    Discontiguous {
        name: String,
        expected: Vpn,
        found: Vpn,
    },
    /// Section carries more file bytes than its pages hold
    #[error("section {name} has {bytes} bytes for {pages} pages")]
    Oversized {
        name: String,
        bytes: usize,
        pages: u32,
    },
    /// Destination is not one page
    #[error("frame buffer of {0} bytes is not one page")]
    BadFrame(usize),
}

/// Per-process view of the executable image
pub trait LazyLoader: Send + Sync {
    /// Pages spanned by the image, starting at page 0
    fn page_count(&self) -> u32;

    /// True if the page's initial contents come from the image
    fn is_image_backed(&self, vpn: Vpn) -> bool;

    /// True if the page must not be written
    fn is_read_only(&self, vpn: Vpn) -> bool;

    /// True if the page holds code
    fn is_executable(&self, vpn: Vpn) -> bool;

    /// Copy the page's initial bytes into a page-sized frame
    fn load_into(&self, vpn: Vpn, frame: &mut [u8]) -> Result<(), LoadError>;
}

// ============================================================================
// Sections
// ============================================================================

/// One loadable section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub first_vpn: Vpn,
    /// Pages the section occupies in memory
    pub pages: u32,
    pub read_only: bool,
    pub executable: bool,
    /// File bytes; anything past them up to `pages` is zero
    pub data: Vec<u8>,
}

impl Section {
    /// Read-only executable section
    pub fn text(name: &str, first_vpn: Vpn, data: Vec<u8>) -> Self {
        let pages = super::pages_for(data.len()).max(1);
        Self {
            name: String::from(name),
            first_vpn,
            pages,
            read_only: true,
            executable: true,
            data,
        }
    }

    /// Writable data section spanning `pages`
    pub fn data(name: &str, first_vpn: Vpn, pages: u32, data: Vec<u8>) -> Self {
        Self {
            name: String::from(name),
            first_vpn,
            pages,
            read_only: false,
            executable: false,
            data,
        }
    }

    /// Read-only data section
    pub fn rodata(name: &str, first_vpn: Vpn, data: Vec<u8>) -> Self {
        let pages = super::pages_for(data.len()).max(1);
        Self {
            name: String::from(name),
            first_vpn,
            pages,
            read_only: true,
            executable: false,
            data,
        }
    }

    /// Page just past the section
    pub fn end_vpn(&self) -> Vpn {
        self.first_vpn.offset(self.pages)
    }

    pub fn contains(&self, vpn: Vpn) -> bool {
        vpn >= self.first_vpn && vpn < self.end_vpn()
    }

    fn copy_page(&self, vpn: Vpn, frame: &mut [u8]) {
        let start = (vpn.0 - self.first_vpn.0) as usize * PAGE_SIZE;
        let file = self.data.get(start..).unwrap_or(&[]);
        let n = file.len().min(PAGE_SIZE);
        frame[..n].copy_from_slice(&file[..n]);
        frame[n..].fill(0);
    }
}

// ============================================================================
// Section Image
// ============================================================================

/// Executable image laid out as contiguous sections from page 0
#[derive(Debug, Clone, Default)]
pub struct SectionImage {
    sections: Vec<Section>,
}

impl SectionImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section; it must start where the image currently ends
    pub fn with_section(mut self, section: Section) -> Result<Self, LoadError> {
        let expected = self.end_vpn();
        if section.first_vpn != expected {
            return Err(LoadError::Discontiguous {
                name: section.name,
                expected,
                found: section.first_vpn,
            });
        }
        if section.data.len() > section.pages as usize * PAGE_SIZE {
            return Err(LoadError::Oversized {
                name: section.name,
                bytes: section.data.len(),
                pages: section.pages,
            });
        }
        self.sections.push(section);
        Ok(self)
    }

    /// Build from a list of sections
    pub fn from_sections(sections: impl IntoIterator<Item = Section>) -> Result<Self, LoadError> {
        sections
            .into_iter()
            .try_fold(Self::new(), |image, section| image.with_section(section))
    }

    /// Image of `pages` pages where page `n` is filled with the byte `n`
    ///
    /// Handy for tests that need to tell reloaded pages apart.
    pub fn patterned(pages: u32, read_only: bool) -> Self {
        let mut data = Vec::with_capacity(pages as usize * PAGE_SIZE);
        for vpn in 0..pages {
            data.extend(core::iter::repeat(vpn as u8).take(PAGE_SIZE));
        }
        let mut section = Section::data(".data", Vpn(0), pages, data);
        section.read_only = read_only;
        Self {
            sections: if pages == 0 { Vec::new() } else { alloc::vec![section] },
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn end_vpn(&self) -> Vpn {
        self.sections.last().map(Section::end_vpn).unwrap_or(Vpn(0))
    }

    fn section_of(&self, vpn: Vpn) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(vpn))
    }
}

impl LazyLoader for SectionImage {
    fn page_count(&self) -> u32 {
        self.end_vpn().0
    }

    fn is_image_backed(&self, vpn: Vpn) -> bool {
        self.section_of(vpn).is_some()
    }

    fn is_read_only(&self, vpn: Vpn) -> bool {
        self.section_of(vpn).map(|s| s.read_only).unwrap_or(false)
    }

    fn is_executable(&self, vpn: Vpn) -> bool {
        self.section_of(vpn).map(|s| s.executable).unwrap_or(false)
    }

    fn load_into(&self, vpn: Vpn, frame: &mut [u8]) -> Result<(), LoadError> {
        if frame.len() != PAGE_SIZE {
            return Err(LoadError::BadFrame(frame.len()));
        }
        let section = self.section_of(vpn).ok_or(LoadError::NotInImage(vpn))?;
        section.copy_page(vpn, frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_sections_classify_pages() {
        let image = SectionImage::from_sections([
            Section::text(".text", Vpn(0), vec![0x90; PAGE_SIZE + 1]),
            Section::rodata(".rdata", Vpn(2), vec![1; 10]),
            Section::data(".data", Vpn(3), 2, vec![2; 10]),
        ])
        .unwrap();

        assert_eq!(image.page_count(), 5);
        assert!(image.is_executable(Vpn(1)));
        assert!(image.is_read_only(Vpn(2)));
        assert!(!image.is_executable(Vpn(2)));
        assert!(!image.is_read_only(Vpn(4)));
        assert!(image.is_image_backed(Vpn(4)));
        assert!(!image.is_image_backed(Vpn(5)));
    }

    #[test]
    fn test_load_zero_fills_tail() {
        let image = SectionImage::new()
            .with_section(Section::data(".data", Vpn(0), 2, vec![7; PAGE_SIZE + 3]))
            .unwrap();
        let mut frame = vec![0xFF; PAGE_SIZE];

        image.load_into(Vpn(1), &mut frame).unwrap();
        assert_eq!(&frame[..3], &[7, 7, 7]);
        assert!(frame[3..].iter().all(|&b| b == 0));

        assert_eq!(
            image.load_into(Vpn(2), &mut frame),
            Err(LoadError::NotInImage(Vpn(2)))
        );
    }

    #[test]
    fn test_rejects_gaps_and_oversize() {
        let gap = SectionImage::new().with_section(Section::text(".text", Vpn(1), vec![0; 4]));
        assert!(matches!(gap, Err(LoadError::Discontiguous { .. })));

        let big = SectionImage::new().with_section(Section::data(
            ".data",
            Vpn(0),
            1,
            vec![0; PAGE_SIZE + 1],
        ));
        assert!(matches!(big, Err(LoadError::Oversized { .. })));
    }

    #[test]
    fn test_patterned_image() {
        let image = SectionImage::patterned(3, true);
        let mut frame = vec![0; PAGE_SIZE];
        image.load_into(Vpn(2), &mut frame).unwrap();
        assert!(frame.iter().all(|&b| b == 2));
        assert!(image.is_read_only(Vpn(0)));
    }
}
