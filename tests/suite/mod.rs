mod capture;
mod crash;
mod module;
mod print;
mod resolve;
