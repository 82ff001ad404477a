pub mod lockdown;
