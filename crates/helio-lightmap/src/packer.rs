//! Shelf rect packer with freeable allocations
//!
//! Rectangles are placed left to right on horizontal shelves; a page grows
//! shelves top to bottom and a new page (array layer) is opened when no
//! existing page has room, up to `max_pages`. Freed rectangles become free
//! spans on their shelf and are reused by later requests of equal or
//! smaller size, so incremental allocation never needs a full repack.

/// Stable handle to a packed rectangle
///
/// Handles carry a generation, so a handle that outlived its allocation
/// (freed, or the packer was cleared) is never confused with a newer one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackerItem {
    index: u32,
    generation: u32,
}

/// Placement returned by [`RectPacker::alloc`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedRect {
    pub item: PackerItem,
    pub page: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug)]
struct Placement {
    page: u32,
    shelf: u32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    footprint: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    placement: Option<Placement>,
}

#[derive(Clone, Copy, Debug)]
struct Span {
    x: u32,
    width: u32,
}

#[derive(Debug)]
struct Shelf {
    y: u32,
    height: u32,
    cursor_x: u32,
    free_spans: Vec<Span>,
    live: u32,
}

impl Shelf {
    fn reset(&mut self, padding: u32) {
        self.cursor_x = padding;
        self.free_spans.clear();
    }

    /// Reserves `need` horizontal texels, returning the x position
    fn take(&mut self, width: u32, need: u32, limit: u32) -> Option<u32> {
        let best = self
            .free_spans
            .iter()
            .enumerate()
            .filter(|(_, s)| s.width >= need)
            .min_by_key(|(_, s)| s.width)
            .map(|(i, _)| i);

        if let Some(i) = best {
            let span = self.free_spans[i];
            if span.width == need {
                self.free_spans.swap_remove(i);
            } else {
                self.free_spans[i] = Span {
                    x: span.x + need,
                    width: span.width - need,
                };
            }
            return Some(span.x);
        }

        if self.cursor_x + width <= limit {
            let x = self.cursor_x;
            self.cursor_x += need;
            return Some(x);
        }
        None
    }

    fn give_back(&mut self, x: u32, footprint: u32) {
        let mut span = Span { x, width: footprint };

        // Merge with neighbours so large requests can reuse the space
        self.free_spans.retain(|s| {
            if s.x + s.width == span.x {
                span = Span { x: s.x, width: s.width + span.width };
                false
            } else if span.x + span.width == s.x {
                span.width += s.width;
                false
            } else {
                true
            }
        });

        if span.x + span.width >= self.cursor_x {
            self.cursor_x = span.x;
        } else {
            self.free_spans.push(span);
        }
    }
}

#[derive(Debug)]
struct Page {
    shelves: Vec<Shelf>,
    next_shelf_y: u32,
    used_area: u64,
}

pub struct RectPacker {
    width: u32,
    height: u32,
    spacing: u32,
    padding: u32,
    max_pages: u32,
    pages: Vec<Page>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
}

impl RectPacker {
    /// `spacing` separates neighbouring rectangles, `padding` keeps them
    /// away from the page edges.
    pub fn new(width: u32, height: u32, spacing: u32, padding: u32, max_pages: u32) -> Self {
        Self {
            width,
            height,
            spacing,
            padding,
            max_pages: max_pages.max(1),
            pages: Vec::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn page_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Never lowers the limit below the pages already open
    pub fn set_max_pages(&mut self, max_pages: u32) {
        self.max_pages = max_pages.max(self.page_count()).max(1);
    }

    pub fn live_items(&self) -> usize {
        self.slots.iter().filter(|s| s.placement.is_some()).count()
    }

    /// Fraction of `page` covered by live rectangles
    pub fn occupancy(&self, page: u32) -> f32 {
        self.pages
            .get(page as usize)
            .map(|p| p.used_area as f32 / (self.width as u64 * self.height as u64) as f32)
            .unwrap_or(0.0)
    }

    /// Packs a `width` x `height` rectangle.
    ///
    /// Returns `None` when the rectangle can never fit a page or every
    /// page, including the last one allowed, is out of room.
    pub fn alloc(&mut self, width: u32, height: u32) -> Option<PackedRect> {
        if width == 0 || height == 0 {
            return None;
        }
        if width + 2 * self.padding > self.width || height + 2 * self.padding > self.height {
            return None;
        }

        for page in 0..self.pages.len() as u32 {
            if let Some(p) = self.try_page(page, width, height) {
                return Some(self.commit(p));
            }
        }

        if self.page_count() < self.max_pages {
            self.pages.push(Page {
                shelves: Vec::new(),
                next_shelf_y: self.padding,
                used_area: 0,
            });
            let page = self.page_count() - 1;
            log::trace!("Rect packer opened page {page}");
            if let Some(p) = self.try_page(page, width, height) {
                return Some(self.commit(p));
            }
        }
        None
    }

    fn try_page(&mut self, page: u32, width: u32, height: u32) -> Option<Placement> {
        let limit_x = self.width - self.padding;
        let limit_y = self.height - self.padding;
        let need = width + self.spacing;
        let padding = self.padding;
        let p = &mut self.pages[page as usize];

        // Tightest existing shelf first
        let mut order: Vec<usize> = (0..p.shelves.len())
            .filter(|&i| p.shelves[i].height >= height)
            .collect();
        order.sort_by_key(|&i| p.shelves[i].height);

        for i in order {
            let shelf = &mut p.shelves[i];
            if shelf.live == 0 && shelf.height > height * 2 {
                continue;
            }
            if let Some(x) = shelf.take(width, need, limit_x) {
                return Some(Placement {
                    page,
                    shelf: i as u32,
                    x,
                    y: shelf.y,
                    width,
                    height,
                    footprint: need,
                });
            }
        }

        if p.next_shelf_y + height > limit_y {
            return None;
        }
        let y = p.next_shelf_y;
        p.next_shelf_y += height + self.spacing;
        let mut shelf = Shelf {
            y,
            height,
            cursor_x: padding,
            free_spans: Vec::new(),
            live: 0,
        };
        let x = shelf.take(width, need, limit_x)?;
        p.shelves.push(shelf);
        Some(Placement {
            page,
            shelf: p.shelves.len() as u32 - 1,
            x,
            y,
            width,
            height,
            footprint: need,
        })
    }

    fn commit(&mut self, placement: Placement) -> PackedRect {
        let page = &mut self.pages[placement.page as usize];
        page.shelves[placement.shelf as usize].live += 1;
        page.used_area += placement.width as u64 * placement.height as u64;

        let index = match self.free_slots.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() as u32 - 1
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.placement = Some(placement);

        PackedRect {
            item: PackerItem {
                index,
                generation: slot.generation,
            },
            page: placement.page,
            x: placement.x,
            y: placement.y,
            width: placement.width,
            height: placement.height,
        }
    }

    /// Current placement of `item`, `None` if the handle is stale
    pub fn get(&self, item: PackerItem) -> Option<PackedRect> {
        let slot = self.slots.get(item.index as usize)?;
        if slot.generation != item.generation {
            return None;
        }
        slot.placement.map(|p| PackedRect {
            item,
            page: p.page,
            x: p.x,
            y: p.y,
            width: p.width,
            height: p.height,
        })
    }

    /// Releases `item`. Returns false for stale handles.
    pub fn free(&mut self, item: PackerItem) -> bool {
        let Some(slot) = self.slots.get_mut(item.index as usize) else {
            return false;
        };
        if slot.generation != item.generation {
            return false;
        }
        let Some(p) = slot.placement.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(item.index);

        let padding = self.padding;
        let page = &mut self.pages[p.page as usize];
        page.used_area -= p.width as u64 * p.height as u64;

        let shelf = &mut page.shelves[p.shelf as usize];
        shelf.live -= 1;
        if shelf.live == 0 {
            shelf.reset(padding);
        } else {
            shelf.give_back(p.x, p.footprint);
        }

        // Trailing empty shelves give their rows back to the page
        while let Some(last) = page.shelves.last() {
            if last.live != 0 {
                break;
            }
            page.next_shelf_y = last.y;
            page.shelves.pop();
        }
        true
    }

    /// Drops every allocation; all outstanding handles become stale.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.placement.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_slots.push(index as u32);
            }
        }
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: &PackedRect, b: &PackedRect, spacing: u32) -> bool {
        a.page == b.page
            && a.x < b.x + b.width + spacing
            && b.x < a.x + a.width + spacing
            && a.y < b.y + b.height + spacing
            && b.y < a.y + a.height + spacing
    }

    #[test]
    fn packs_without_overlap_and_respects_spacing() {
        let mut packer = RectPacker::new(256, 256, 3, 3, 1);
        let mut placed = Vec::new();
        for i in 0..40u32 {
            let r = packer.alloc(10 + i % 7, 8 + i % 5).unwrap();
            assert!(r.x >= 3 && r.y >= 3);
            assert!(r.x + r.width <= 253 && r.y + r.height <= 253);
            placed.push(r);
        }
        for (i, a) in placed.iter().enumerate() {
            for b in &placed[i + 1..] {
                assert!(!overlaps(a, b, 3), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn largest_tile_fits_exactly_inside_padding() {
        let mut packer = RectPacker::new(2048, 2048, 3, 3, 1);
        let r = packer.alloc(2042, 2042).unwrap();
        assert_eq!((r.x, r.y), (3, 3));
        assert!(packer.alloc(1, 1).is_none());
        assert!(RectPacker::new(2048, 2048, 3, 3, 1).alloc(2043, 4).is_none());
    }

    #[test]
    fn opens_new_pages_up_to_the_limit() {
        let mut packer = RectPacker::new(64, 64, 0, 0, 2);
        let a = packer.alloc(64, 64).unwrap();
        let b = packer.alloc(64, 64).unwrap();
        assert_eq!((a.page, b.page), (0, 1));
        assert!(packer.alloc(1, 1).is_none());
        assert_eq!(packer.page_count(), 2);
    }

    #[test]
    fn freed_space_is_reused() {
        let mut packer = RectPacker::new(64, 64, 0, 0, 1);
        let row: Vec<_> = (0..4).map(|_| packer.alloc(16, 16).unwrap()).collect();
        let _second = packer.alloc(64, 16).unwrap();

        assert!(packer.free(row[1].item));
        assert!(packer.free(row[2].item));
        let wide = packer.alloc(32, 16).unwrap();
        assert_eq!((wide.x, wide.y), (16, 0));
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut packer = RectPacker::new(64, 64, 0, 0, 1);
        let a = packer.alloc(8, 8).unwrap();
        assert!(packer.free(a.item));
        assert!(!packer.free(a.item));
        assert!(packer.get(a.item).is_none());

        let b = packer.alloc(8, 8).unwrap();
        assert_ne!(a.item, b.item);
        assert_eq!(packer.get(b.item), Some(b));

        packer.clear();
        assert!(packer.get(b.item).is_none());
        assert_eq!(packer.live_items(), 0);
    }

    #[test]
    fn emptied_page_accepts_a_full_size_rect() {
        let mut packer = RectPacker::new(32, 32, 0, 0, 1);
        let items: Vec<_> = (0..16).map(|_| packer.alloc(8, 8).unwrap().item).collect();
        assert!(packer.alloc(8, 8).is_none());
        for item in items {
            packer.free(item);
        }
        assert_eq!(packer.occupancy(0), 0.0);
        assert!(packer.alloc(32, 32).is_some());
    }
}
